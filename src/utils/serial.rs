use std::{
    fs::File,
    io::{Read, Write},
    sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use subprocess::{unix::PopenExt, Popen, PopenConfig, Redirection};

use crate::error::RemoteError;

/// Line oriented access to the RIOT shell of one node.
pub trait NodeConsole {
    fn node(&self) -> &str;

    /// Sends `line` and collects output until the shell prompt comes back or
    /// `timeout` passes. Running out of time is not an error.
    fn cmd(&mut self, line: &str, timeout: Duration) -> Result<String, RemoteError>;
}

pub trait Consoles {
    fn open(&self, destination: &str, node: &str) -> Result<Box<dyn NodeConsole>, RemoteError>;
}

/// Serial port of a node, reached through `nc` on the frontend.
pub struct SerialConsole {
    node: String,
    process: Popen,
    stdin: Option<File>,
    receiver: Receiver<String>,
    reader: Option<JoinHandle<()>>,
}

impl SerialConsole {
    pub fn open(destination: &str, node: &str) -> Result<Self, RemoteError> {
        Self::spawn(&["ssh", destination, "nc", node, "20000"], node)
    }

    pub fn spawn(argv: &[&str], node: &str) -> Result<Self, RemoteError> {
        let console_err = |reason: String| RemoteError::Console {
            node: node.to_owned(),
            reason,
        };

        let mut process = Popen::create(
            argv,
            PopenConfig {
                stdin: Redirection::Pipe,
                stdout: Redirection::Pipe,
                stderr: Redirection::Merge,
                ..Default::default()
            },
        )
        .map_err(|e| RemoteError::Spawn {
            cmd: argv.join(" "),
            reason: e.to_string(),
        })?;

        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| console_err("no stdout pipe".to_owned()))?;
        let stdin = process.stdin.take();

        let (sender, receiver) = channel();
        let reader = thread::spawn(move || SerialConsole::receive_thread(stdout, sender));

        debug!("console of {} opened", node);
        Ok(SerialConsole {
            node: node.to_owned(),
            process,
            stdin,
            receiver,
            reader: Some(reader),
        })
    }

    fn receive_thread(mut stdout: File, sender: Sender<String>) {
        let mut buf = [0u8; 1024];
        loop {
            match stdout.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if sender.send(chunk).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("console read error: {}", e);
                    break;
                }
            }
        }
    }

    fn console_err(&self, reason: impl Into<String>) -> RemoteError {
        RemoteError::Console {
            node: self.node.clone(),
            reason: reason.into(),
        }
    }
}

fn prompt_reached(out: &str) -> bool {
    out == "> " || out.ends_with("\n> ")
}

impl NodeConsole for SerialConsole {
    fn node(&self) -> &str {
        &self.node
    }

    fn cmd(&mut self, line: &str, timeout: Duration) -> Result<String, RemoteError> {
        // drop whatever arrived since the last command
        while self.receiver.try_recv().is_ok() {}

        let stdin = match self.stdin.as_mut() {
            Some(stdin) => stdin,
            None => return Err(self.console_err("stdin closed")),
        };
        let res = writeln!(stdin, "{}", line).and_then(|_| stdin.flush());
        if let Err(e) = res {
            return Err(self.console_err(e.to_string()));
        }

        let deadline = Instant::now() + timeout;
        let mut out = String::new();
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.receiver.recv_timeout(deadline - now) {
                Ok(chunk) => {
                    out.push_str(&chunk);
                    if prompt_reached(&out) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(self.console_err("connection closed"))
                }
            }
        }
        trace!("{} <- {:?}", self.node, out);
        Ok(out)
    }
}

impl Drop for SerialConsole {
    fn drop(&mut self) {
        self.stdin.take();
        if self.process.poll().is_none() {
            _ = self.process.send_signal(libc::SIGTERM);
            let exited = self
                .process
                .wait_timeout(Duration::from_secs(1))
                .ok()
                .flatten()
                .is_some();
            if !exited {
                _ = self.process.kill();
                _ = self.process.wait();
            }
        }
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("console reader of {} panicked", self.node);
            }
        }
        debug!("console of {} closed", self.node);
    }
}

/// Opens [`SerialConsole`]s through the frontend.
pub struct SerialConsoles;

impl Consoles for SerialConsoles {
    fn open(&self, destination: &str, node: &str) -> Result<Box<dyn NodeConsole>, RemoteError> {
        Ok(Box::new(SerialConsole::open(destination, node)?))
    }
}
