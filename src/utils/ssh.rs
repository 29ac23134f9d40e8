use std::{cell::RefCell, collections::BTreeSet, rc::Rc};

use crate::error::RemoteError;

use super::command::{Cmd, CommandRunner};

/// SSH access to the frontend of one testbed site.
///
/// Long running remote processes get their own master connection, typed into
/// the tmux pane that hosts them. Everything else goes through one-shot
/// clients.
pub struct RemoteShell {
    runner: Rc<dyn CommandRunner>,
    destination: String,
    masters: RefCell<BTreeSet<String>>,
}

impl RemoteShell {
    /// The frontend user is taken from `IOTLAB_USER`, then `USER`.
    pub fn new(runner: Rc<dyn CommandRunner>, site: &str) -> Self {
        let user = std::env::var("IOTLAB_USER")
            .or_else(|_| std::env::var("USER"))
            .unwrap_or_else(|_| "root".to_owned());
        Self::with_user(runner, &user, site)
    }

    pub fn with_user(runner: Rc<dyn CommandRunner>, user: &str, site: &str) -> Self {
        RemoteShell {
            runner,
            destination: format!("{}@{}.iot-lab.info", user, site),
            masters: RefCell::new(BTreeSet::new()),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn run_once(&self, remote: &str) -> Result<String, RemoteError> {
        self.runner
            .output(&Cmd::new("ssh").arg(&self.destination).arg(remote))
    }

    /// Streams `content` into `path` on the frontend.
    pub fn write_file(&self, path: &str, content: &str) -> Result<(), RemoteError> {
        self.runner.output(
            &Cmd::new("ssh")
                .arg(&self.destination)
                .arg(format!("tee {} > /dev/null", path))
                .stdin(content),
        )?;
        Ok(())
    }

    /// Line that starts a master connection on `path` when typed into a pane.
    pub fn open_master(&self, path: &str) -> String {
        self.masters.borrow_mut().insert(path.to_owned());
        format!("ssh -S {} -M {}", path, self.destination)
    }

    /// Line that runs `remote` through a fresh client connection.
    pub fn client_line(&self, remote: &str) -> String {
        format!("ssh {} {}", self.destination, remote)
    }

    pub fn close_master(&self, path: &str) {
        self.masters.borrow_mut().remove(path);
        let res = self.runner.output(
            &Cmd::new("ssh")
                .args(["-O", "exit", "-S", path])
                .arg(&self.destination),
        );
        if let Err(e) = res {
            debug!("closing master {} failed: {}", path, e);
        }
    }

    pub fn close_all(&self) {
        let masters: Vec<String> = self.masters.borrow().iter().cloned().collect();
        for path in masters {
            self.close_master(&path);
        }
    }
}

impl Drop for RemoteShell {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Local control socket path of one master, unique per experiment.
pub fn control_path(site: &str, role: &str, descs_stem: &str, exp_id: u64) -> String {
    let mut path = std::env::temp_dir();
    path.push(format!(".ssh-{}-{}-{}-{}", site, role, descs_stem, exp_id));
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utils::mock::MockRunner;

    #[test]
    fn close_master_is_idempotent_and_silent() {
        let runner = MockRunner::new();
        runner.fail("-O exit");
        let shell = RemoteShell::with_user(runner.clone(), "alice", "grenoble");

        let line = shell.open_master("/tmp/.ssh-br");
        assert_eq!(line, "ssh -S /tmp/.ssh-br -M alice@grenoble.iot-lab.info");

        shell.close_master("/tmp/.ssh-br");
        shell.close_master("/tmp/.ssh-br");
        assert_eq!(runner.count("-O exit -S /tmp/.ssh-br"), 2);
    }

    #[test]
    fn drop_closes_open_masters() {
        let runner = MockRunner::new();
        {
            let shell = RemoteShell::with_user(runner.clone(), "alice", "lille");
            shell.open_master("/tmp/a");
            shell.open_master("/tmp/b");
            shell.close_master("/tmp/a");
        }
        assert_eq!(runner.count("-O exit -S /tmp/a"), 1);
        assert_eq!(runner.count("-O exit -S /tmp/b"), 1);
    }

    #[test]
    fn write_file_uses_stdin() {
        let runner = MockRunner::new();
        let shell = RemoteShell::with_user(runner.clone(), "alice", "grenoble");
        shell.write_file("/tmp/tmp.X", "transports: {}\n").unwrap();

        let cmds = runner.log();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].args[1], "tee /tmp/tmp.X > /dev/null");
        assert_eq!(cmds[0].stdin.as_deref(), Some("transports: {}\n"));
    }

    #[test]
    fn control_paths_are_experiment_scoped() {
        let a = control_path("grenoble", "resolver", "descs", 1);
        let b = control_path("grenoble", "resolver", "descs", 2);
        assert_ne!(a, b);
        assert!(a.ends_with(".ssh-grenoble-resolver-descs-1"));
    }
}
