use std::{fmt, path::PathBuf};

use subprocess::{Exec, Redirection};

use crate::error::RemoteError;

/// A local command line, built up before it is handed to a [`CommandRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Cmd {
            program: program.into(),
            args: vec![],
            stdin: None,
            env: vec![],
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.env {
            write!(f, "{}={} ", k, v)?;
        }
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Everything the dispatcher executes goes through this.
pub trait CommandRunner {
    /// Runs `cmd` to completion and returns its stdout. A non-zero exit is an error.
    fn output(&self, cmd: &Cmd) -> Result<String, RemoteError>;
}

/// Runs commands as local child processes.
pub struct Subprocess;

impl CommandRunner for Subprocess {
    fn output(&self, cmd: &Cmd) -> Result<String, RemoteError> {
        debug!("running `{}`", cmd);

        let mut exec = Exec::cmd(&cmd.program)
            .args(cmd.args.as_slice())
            .stdout(Redirection::Pipe)
            .stderr(Redirection::Pipe);
        for (k, v) in &cmd.env {
            exec = exec.env(k, v);
        }
        if let Some(dir) = &cmd.cwd {
            exec = exec.cwd(dir);
        }
        if let Some(input) = &cmd.stdin {
            exec = exec.stdin(input.as_str());
        }

        let capture = exec.capture().map_err(|e| RemoteError::Spawn {
            cmd: cmd.to_string(),
            reason: e.to_string(),
        })?;

        if capture.success() {
            Ok(capture.stdout_str())
        } else {
            Err(RemoteError::Failed {
                cmd: cmd.to_string(),
                status: format!("{:?}", capture.exit_status),
                stderr: capture.stderr_str().trim().to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_quotes_whitespace() {
        let cmd = Cmd::new("ssh")
            .arg("alice@grenoble.iot-lab.info")
            .arg("ip -6 route")
            .env("QUIETER", "1");
        assert_eq!(
            cmd.to_string(),
            "QUIETER=1 ssh alice@grenoble.iot-lab.info 'ip -6 route'"
        );
    }

    #[test]
    fn subprocess_captures_stdout() {
        let out = Subprocess.output(&Cmd::new("echo").arg("hello")).unwrap();
        assert_eq!(out, "hello\n");
    }

    #[test]
    fn subprocess_feeds_stdin() {
        let out = Subprocess
            .output(&Cmd::new("cat").stdin("resolver: config\n"))
            .unwrap();
        assert_eq!(out, "resolver: config\n");
    }

    #[test]
    fn subprocess_reports_failure() {
        let err = Subprocess.output(&Cmd::new("false")).unwrap_err();
        assert!(matches!(err, RemoteError::Failed { .. }));
    }
}
