use std::rc::Rc;

use crate::error::RemoteError;

use super::command::{Cmd, CommandRunner};

/// First pane of a named window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pane {
    name: String,
    target: String,
}

impl Pane {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

/// Named windows inside one tmux session. Nothing here waits for the typed
/// commands to finish.
pub struct Tmux {
    runner: Rc<dyn CommandRunner>,
    session: String,
    agent: Option<(String, String)>,
}

impl Tmux {
    pub fn new(runner: Rc<dyn CommandRunner>, session: &str) -> Self {
        let agent = match (std::env::var("SSH_AUTH_SOCK"), std::env::var("SSH_AGENT_PID")) {
            (Ok(sock), Ok(pid)) => Some((sock, pid)),
            _ => None,
        };
        Tmux {
            runner,
            session: session.to_owned(),
            agent,
        }
    }

    pub fn with_agent(mut self, agent: Option<(String, String)>) -> Self {
        self.agent = agent;
        self
    }

    fn tmux(&self, sub: &str) -> Cmd {
        Cmd::new("tmux").arg(sub)
    }

    pub fn ensure_session(&self) -> Result<(), RemoteError> {
        if self
            .runner
            .output(&self.tmux("has-session").args(["-t", self.session.as_str()]))
            .is_ok()
        {
            return Ok(());
        }
        info!("creating tmux session {}", self.session);
        self.runner
            .output(&self.tmux("new-session").args(["-d", "-s", self.session.as_str()]))?;
        Ok(())
    }

    pub fn get_or_create(&self, name: &str) -> Result<Pane, RemoteError> {
        self.ensure_session()?;

        let windows = self.runner.output(
            &self
                .tmux("list-windows")
                .args(["-t", self.session.as_str(), "-F", "#{window_name}"]),
        )?;
        if !windows.lines().any(|w| w.trim() == name) {
            debug!("creating tmux window {}", name);
            self.runner.output(&self.tmux("new-window").args([
                "-d",
                "-t",
                format!("{}:", self.session).as_str(),
                "-n",
                name,
            ]))?;
        }

        let pane = Pane {
            name: name.to_owned(),
            target: format!("{}:{}.0", self.session, name),
        };
        for _ in 0..3 {
            self.interrupt(&pane)?;
        }
        if let Some((sock, pid)) = &self.agent {
            self.send_line(
                &pane,
                &format!("export SSH_AUTH_SOCK={} SSH_AGENT_PID={}", sock, pid),
            )?;
        }
        Ok(pane)
    }

    /// Types `text` literally, prefixed by a space so it stays out of the
    /// shell history, and presses Enter.
    pub fn send_line(&self, pane: &Pane, text: &str) -> Result<(), RemoteError> {
        self.runner.output(&self.tmux("send-keys").args([
            "-t",
            pane.target(),
            "-l",
            format!(" {}", text).as_str(),
        ]))?;
        self.runner
            .output(&self.tmux("send-keys").args(["-t", pane.target(), "Enter"]))?;
        Ok(())
    }

    pub fn interrupt(&self, pane: &Pane) -> Result<(), RemoteError> {
        self.runner
            .output(&self.tmux("send-keys").args(["-t", pane.target(), "C-c"]))?;
        Ok(())
    }

    /// The last `lines` lines of scrollback, wrapped lines joined.
    pub fn capture(&self, pane: &Pane, lines: usize) -> Result<String, RemoteError> {
        self.runner.output(&self.tmux("capture-pane").args([
            "-p",
            "-J",
            "-t",
            pane.target(),
            "-S",
            format!("-{}", lines).as_str(),
        ]))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utils::mock::MockRunner;

    #[test]
    fn get_or_create_makes_missing_window_once() {
        let runner = MockRunner::new();
        let tmux = Tmux::new(runner.clone(), "dispatch").with_agent(None);

        let pane = tmux.get_or_create("resolver").unwrap();
        assert_eq!(pane.target(), "dispatch:resolver.0");
        assert_eq!(pane.name(), "resolver");
        let again = tmux.get_or_create("resolver").unwrap();
        assert_eq!(pane, again);

        assert_eq!(runner.count("new-window"), 1);
        assert_eq!(runner.count("send-keys -t dispatch:resolver.0 C-c"), 6);
    }

    #[test]
    fn agent_is_exported_into_new_panes() {
        let runner = MockRunner::new();
        let tmux = Tmux::new(runner.clone(), "dispatch")
            .with_agent(Some(("/tmp/agent.sock".to_owned(), "4242".to_owned())));

        let pane = tmux.get_or_create("border-router").unwrap();
        assert_eq!(
            runner.typed(&pane),
            vec!["export SSH_AUTH_SOCK=/tmp/agent.sock SSH_AGENT_PID=4242"]
        );
    }

    #[test]
    fn send_line_prefixes_space() {
        let runner = MockRunner::new();
        let tmux = Tmux::new(runner.clone(), "s").with_agent(None);
        let pane = tmux.get_or_create("run").unwrap();
        tmux.send_line(&pane, "ifconfig").unwrap();

        assert_eq!(runner.count("send-keys -t s:run.0 -l ' ifconfig'"), 1);
        assert_eq!(runner.count("send-keys -t s:run.0 Enter"), 1);
    }

    #[test]
    fn capture_returns_scrollback() {
        let runner = MockRunner::new();
        runner.on_pane(|line| (line == "ps").then(|| "\tpid | name\n".to_owned()));
        let tmux = Tmux::new(runner.clone(), "s").with_agent(None);
        let pane = tmux.get_or_create("run").unwrap();
        tmux.send_line(&pane, "ps").unwrap();

        let out = tmux.capture(&pane, 100).unwrap();
        assert!(out.contains("ps\n\tpid | name"));
    }
}
