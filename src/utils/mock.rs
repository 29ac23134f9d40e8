//! Test doubles for the command runner, clock, node consoles and testbed.

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, BTreeSet},
    path::Path,
    rc::Rc,
    time::Duration,
};

use crate::{
    error::RemoteError,
    testbed::{FirmwareBuild, Power, Reservation, Testbed},
};

use super::{
    command::{Cmd, CommandRunner},
    serial::{Consoles, NodeConsole},
    ssh::RemoteShell,
    tmux::{Pane, Tmux},
    Clock, Session,
};

/// Session of user `alice` on the grenoble frontend, tmux session `test`.
pub fn session(runner: &Rc<MockRunner>, clock: &Rc<MockClock>) -> Session {
    Session {
        runner: runner.clone(),
        shell: Rc::new(RemoteShell::with_user(runner.clone(), "alice", "grenoble")),
        tmux: Rc::new(Tmux::new(runner.clone(), "test").with_agent(None)),
        clock: clock.clone(),
    }
}

type Rule = Box<dyn Fn(&Cmd) -> Option<Result<String, RemoteError>>>;
type PaneRule = Box<dyn Fn(&str) -> Option<String>>;

/// Records every command. Answers from rules (latest first) and simulates
/// tmux windows and scrollback.
#[derive(Default)]
pub struct MockRunner {
    log: RefCell<Vec<Cmd>>,
    rules: RefCell<Vec<Rule>>,
    pane_rules: RefCell<Vec<PaneRule>>,
    windows: RefCell<BTreeSet<String>>,
    scrollback: RefCell<BTreeMap<String, String>>,
}

impl MockRunner {
    pub fn new() -> Rc<Self> {
        Rc::new(MockRunner::default())
    }

    pub fn respond(&self, rule: impl Fn(&Cmd) -> Option<Result<String, RemoteError>> + 'static) {
        self.rules.borrow_mut().push(Box::new(rule));
    }

    /// Commands whose rendering contains `needle` print `stdout`.
    pub fn on(&self, needle: &str, stdout: &str) {
        let needle = needle.to_owned();
        let stdout = stdout.to_owned();
        self.respond(move |cmd| cmd.to_string().contains(&needle).then(|| Ok(stdout.clone())));
    }

    pub fn fail(&self, needle: &str) {
        let needle = needle.to_owned();
        self.respond(move |cmd| {
            let rendered = cmd.to_string();
            rendered.contains(&needle).then(|| {
                Err(RemoteError::Failed {
                    cmd: rendered,
                    status: "Exited(1)".to_owned(),
                    stderr: String::new(),
                })
            })
        });
    }

    /// Output printed into a pane after a typed line.
    pub fn on_pane(&self, rule: impl Fn(&str) -> Option<String> + 'static) {
        self.pane_rules.borrow_mut().push(Box::new(rule));
    }

    pub fn log(&self) -> Vec<Cmd> {
        self.log.borrow().clone()
    }

    pub fn rendered(&self) -> Vec<String> {
        self.log.borrow().iter().map(|c| c.to_string()).collect()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.rendered().iter().filter(|c| c.contains(needle)).count()
    }

    /// Lines typed into `pane`, without the leading space.
    pub fn typed(&self, pane: &Pane) -> Vec<String> {
        self.typed_into(pane.target())
    }

    pub fn typed_into(&self, target: &str) -> Vec<String> {
        self.log
            .borrow()
            .iter()
            .filter(|c| c.program == "tmux" && c.args.first().map(String::as_str) == Some("send-keys"))
            .filter(|c| c.args.iter().any(|a| a == "-l") && c.args.get(2).map(String::as_str) == Some(target))
            .filter_map(|c| c.args.last())
            .map(|l| l.trim_start().to_owned())
            .collect()
    }

    fn tmux(&self, cmd: &Cmd) -> String {
        let flag = |f: &str| {
            cmd.args
                .iter()
                .position(|a| a == f)
                .and_then(|i| cmd.args.get(i + 1))
                .cloned()
                .unwrap_or_default()
        };
        match cmd.args.first().map(String::as_str) {
            Some("list-windows") => self
                .windows
                .borrow()
                .iter()
                .map(|w| format!("{}\n", w))
                .collect(),
            Some("new-window") => {
                self.windows.borrow_mut().insert(flag("-n"));
                String::new()
            }
            Some("send-keys") if cmd.args.iter().any(|a| a == "-l") => {
                let line = cmd.args.last().cloned().unwrap_or_default();
                let line = line.trim_start();
                let mut printed = format!("{}\n", line);
                for rule in self.pane_rules.borrow().iter() {
                    if let Some(out) = rule(line) {
                        printed.push_str(&out);
                    }
                }
                self.scrollback
                    .borrow_mut()
                    .entry(flag("-t"))
                    .or_default()
                    .push_str(&printed);
                String::new()
            }
            Some("capture-pane") => self
                .scrollback
                .borrow()
                .get(&flag("-t"))
                .cloned()
                .unwrap_or_default(),
            _ => String::new(),
        }
    }
}

impl CommandRunner for MockRunner {
    fn output(&self, cmd: &Cmd) -> Result<String, RemoteError> {
        self.log.borrow_mut().push(cmd.clone());
        for rule in self.rules.borrow().iter().rev() {
            if let Some(res) = rule(cmd) {
                return res;
            }
        }
        if cmd.program == "tmux" {
            return Ok(self.tmux(cmd));
        }
        Ok(String::new())
    }
}

/// Time that only moves when slept.
pub struct MockClock {
    now: Cell<i64>,
    sleeps: RefCell<Vec<Duration>>,
    interrupted: Cell<bool>,
}

impl MockClock {
    pub fn new(start: i64) -> Self {
        MockClock {
            now: Cell::new(start),
            sleeps: RefCell::new(vec![]),
            interrupted: Cell::new(false),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }

    pub fn interrupt(&self) {
        self.interrupted.set(true);
    }
}

impl Clock for MockClock {
    fn sleep(&self, dur: Duration) {
        self.sleeps.borrow_mut().push(dur);
        self.now.set(self.now.get() + dur.as_secs() as i64);
    }

    fn now(&self) -> i64 {
        self.now.get()
    }

    fn interrupted(&self) -> bool {
        self.interrupted.get()
    }
}

type Responder = dyn Fn(&str, &str) -> String;

/// Consoles answering from one responder taking `(node, line)`.
pub struct MockConsoles {
    responder: Rc<Responder>,
    sent: Rc<RefCell<Vec<(String, String)>>>,
    timeouts: Rc<RefCell<Vec<(String, Duration)>>>,
    live: Rc<Cell<usize>>,
}

impl MockConsoles {
    pub fn new(responder: impl Fn(&str, &str) -> String + 'static) -> Rc<Self> {
        Rc::new(MockConsoles {
            responder: Rc::new(responder),
            sent: Rc::new(RefCell::new(vec![])),
            timeouts: Rc::new(RefCell::new(vec![])),
            live: Rc::new(Cell::new(0)),
        })
    }

    pub fn healthy() -> Rc<Self> {
        Self::new(healthy_node)
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.borrow().clone()
    }

    pub fn sent_to(&self, node: &str) -> Vec<String> {
        self.sent
            .borrow()
            .iter()
            .filter(|(n, _)| n == node)
            .map(|(_, l)| l.clone())
            .collect()
    }

    /// Timeouts given to every command starting with `prefix`.
    pub fn timeouts(&self, prefix: &str) -> Vec<Duration> {
        self.timeouts
            .borrow()
            .iter()
            .filter(|(l, _)| l.starts_with(prefix))
            .map(|(_, t)| *t)
            .collect()
    }

    /// Consoles currently open.
    pub fn live(&self) -> usize {
        self.live.get()
    }
}

impl Consoles for MockConsoles {
    fn open(&self, _destination: &str, node: &str) -> Result<Box<dyn NodeConsole>, RemoteError> {
        self.live.set(self.live.get() + 1);
        Ok(Box::new(MockConsole {
            node: node.to_owned(),
            responder: self.responder.clone(),
            sent: self.sent.clone(),
            timeouts: self.timeouts.clone(),
            live: self.live.clone(),
        }))
    }
}

struct MockConsole {
    node: String,
    responder: Rc<Responder>,
    sent: Rc<RefCell<Vec<(String, String)>>>,
    timeouts: Rc<RefCell<Vec<(String, Duration)>>>,
    live: Rc<Cell<usize>>,
}

impl NodeConsole for MockConsole {
    fn node(&self) -> &str {
        &self.node
    }

    fn cmd(&mut self, line: &str, timeout: Duration) -> Result<String, RemoteError> {
        self.sent
            .borrow_mut()
            .push((self.node.clone(), line.to_owned()));
        self.timeouts.borrow_mut().push((line.to_owned(), timeout));
        Ok(format!("{}\n{}> ", line, (self.responder)(&self.node, line)))
    }
}

impl Drop for MockConsole {
    fn drop(&mut self) {
        self.live.set(self.live.get() - 1);
    }
}

/// A node whose shell answers everything the way a working requester does.
pub fn healthy_node(node: &str, line: &str) -> String {
    let n = crate::network::number(node);
    let mut words = line.split_whitespace();
    match words.next().unwrap_or("") {
        "ifconfig" => format!(
            "Iface  6  HWaddr: 00:0{n}\n          inet6 addr: fe80::{n}  scope: link  VAL\n          inet6 addr: 2001:db8:0:1::{n}  scope: global  VAL\n"
        ),
        "rpl" => "instance table:\t[X]\t[ ]\n parent table:\t[X]\t[ ]\t[ ]\n\t\tparent [addr: fe80::2 | rank: 512 | lifetime: 292s]\n".to_owned(),
        "nib" => "2001:db8::/64 dev #6\ndefault* via fe80::2 dev #6\n".to_owned(),
        "ping6" => "--- 2001:db8::1 PING statistics ---\n3 packets transmitted, 3 packets received, 0% packet loss\n".to_owned(),
        "init" => "Successfully initialized\nSuccess\n".to_owned(),
        "userctx" => "Successfully added user context\n".to_owned(),
        "query_bulk" if words.next() == Some("add") => {
            format!("Will wait {} ms\n", words.next().unwrap_or(""))
        }
        "proxy" => format!("Configured proxy {}\n", words.next().unwrap_or("")),
        "query" => "t;42 \n".to_owned(),
        _ => String::new(),
    }
}

/// Records every call as a short string.
#[derive(Default)]
pub struct MockTestbed {
    calls: RefCell<Vec<String>>,
    next_id: Cell<u64>,
    failing: RefCell<BTreeSet<String>>,
}

impl MockTestbed {
    pub fn new(first_id: u64) -> Rc<Self> {
        let tb = MockTestbed::default();
        tb.next_id.set(first_id);
        Rc::new(tb)
    }

    /// Calls starting with `prefix` fail.
    pub fn fail(&self, prefix: &str) {
        self.failing.borrow_mut().insert(prefix.to_owned());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls.borrow().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) -> anyhow::Result<()> {
        let fails = self.failing.borrow().iter().any(|p| call.starts_with(p.as_str()));
        self.calls.borrow_mut().push(call.clone());
        if fails {
            anyhow::bail!("{} failed", call);
        }
        Ok(())
    }
}

impl Testbed for MockTestbed {
    fn build(&self, firmware: &FirmwareBuild) -> anyhow::Result<()> {
        self.record(format!(
            "build {} {}",
            firmware.app.display(),
            firmware.env.get("WHITELIST_NAME").map_or("-", String::as_str)
        ))
    }

    fn submit(&self, reservation: &Reservation) -> anyhow::Result<u64> {
        self.record(format!(
            "submit {} {} {}",
            reservation.name,
            reservation.duration_min,
            reservation.nodes.join(",")
        ))?;
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        Ok(id)
    }

    fn wait_running(&self, exp_id: u64) -> anyhow::Result<()> {
        self.record(format!("wait {}", exp_id))
    }

    fn stop(&self, exp_id: u64) -> anyhow::Result<()> {
        self.record(format!("stop {}", exp_id))
    }

    fn flash(&self, exp_id: u64, _site: &str, node: &str, elf: &Path) -> anyhow::Result<()> {
        self.record(format!("flash {} {} {}", exp_id, node, elf.display()))
    }

    fn power(&self, exp_id: u64, _site: &str, node: &str, action: Power) -> anyhow::Result<()> {
        self.record(format!("power {} {} {:?}", exp_id, node, action))
    }
}
