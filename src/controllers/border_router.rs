use std::{collections::BTreeSet, time::Duration};

use anyhow::Context;
use ipnet::Ipv6Net;

use crate::{
    error::ExperimentError,
    network::Network,
    utils::{tmux::Pane, wait_for_predicate, Retry, Session},
};

use super::resolver::PortTable;

const SINK_CHECK: Retry = Retry::new(3, Duration::from_secs(2));
const ETHOS_FAILURES: [&str; 2] = ["No such process: ethos", "ethos lost serial connection"];

/// Smallest `tapN` that `ip link` does not list.
pub fn free_tap(ip_link: &str) -> String {
    let used: BTreeSet<u32> = ip_link
        .lines()
        .filter(|l| !l.starts_with(char::is_whitespace))
        .filter_map(|l| {
            let (index, rest) = l.split_once(": ")?;
            index.trim().parse::<u32>().ok()?;
            let name = rest.split(':').next()?;
            let name = name.split('@').next()?;
            name.strip_prefix("tap")?.parse().ok()
        })
        .collect();
    let n = (0..).find(|n| !used.contains(n)).unwrap_or_default();
    format!("tap{}", n)
}

/// First /64 of `prefix` that no route in `ip -6 route` points at.
pub fn free_subnet(prefix: Ipv6Net, ip_route: &str) -> Option<Ipv6Net> {
    let routed: BTreeSet<Ipv6Net> = ip_route
        .lines()
        .filter_map(|l| l.split_whitespace().next()?.parse().ok())
        .collect();
    prefix
        .subnets(64)
        .ok()?
        .find(|net| !routed.contains(net))
}

/// Verdict on a sink capture: `Some(())` once the sink has a global
/// address, an error when ethos died.
pub fn sink_verdict(capture: &str, marker: &str) -> Result<Option<()>, String> {
    let echo = format!("command not found: {}", marker);
    let after = match capture.rfind(&echo) {
        Some(i) => &capture[i + echo.len()..],
        None => return Ok(None),
    };
    if let Some(failure) = ETHOS_FAILURES.iter().find(|f| after.contains(*f)) {
        return Err(failure.to_string());
    }
    Ok(after.contains("scope: global").then_some(()))
}

/// Lines typed after `marker`, up to the `reboot` that ends the diagnostics.
pub fn extract_br_log(capture: &str, marker: &str) -> String {
    let echo = format!("command not found: {}", marker);
    let mut lines = capture.lines().skip_while(|l| !l.contains(&echo));
    if lines.next().is_none() {
        return String::new();
    }
    lines
        .take_while(|l| l.trim_start_matches("> ").trim() != "reboot")
        .map(|l| format!("{}\n", l))
        .collect()
}

struct Params {
    sink: String,
    site_prefix: Ipv6Net,
}

/// The ethos gateway between the frontend and the sink node.
pub struct BorderRouter {
    session: Session,
    ports: PortTable,
    control_path: String,
    params: Option<Params>,
    pane: Option<Pane>,
    tap: Option<String>,
}

impl BorderRouter {
    pub fn new(session: Session, ports: PortTable, control_path: String) -> Self {
        BorderRouter {
            session,
            ports,
            control_path,
            params: None,
            pane: None,
            tap: None,
        }
    }

    pub fn pane(&self) -> Option<&Pane> {
        self.pane.as_ref()
    }

    pub fn tap(&self) -> Option<&str> {
        self.tap.as_deref()
    }

    pub fn start(&mut self, network: &Network, site_prefix: &str) -> anyhow::Result<()> {
        let site_prefix: Ipv6Net = site_prefix
            .parse()
            .with_context(|| format!("bad SITE_PREFIX '{}'", site_prefix))?;
        self.params = Some(Params {
            sink: network.sink().to_owned(),
            site_prefix,
        });
        self.bring_up()
    }

    /// Stops and starts again with the parameters of the last `start`.
    pub fn restart(&mut self) -> anyhow::Result<()> {
        self.stop();
        self.bring_up()
    }

    fn bring_up(&mut self) -> anyhow::Result<()> {
        let (sink, prefix) = match &self.params {
            Some(p) => (p.sink.clone(), p.site_prefix),
            None => anyhow::bail!("border router restarted before it was started"),
        };
        let fail = |reason: String| ExperimentError::BorderRouter {
            sink: sink.clone(),
            reason,
        };
        let Session { shell, tmux, clock, .. } = &self.session;

        let tap = free_tap(&shell.run_once("ip link")?);
        let subnet = free_subnet(prefix, &shell.run_once("ip -6 route")?)
            .ok_or_else(|| fail(format!("no free /64 left in {}", prefix)))?;
        info!("starting border router on {} with {} via {}", sink, subnet, tap);

        shell.close_master(&self.control_path);
        let pane = tmux.get_or_create("border-router")?;
        self.pane = Some(pane.clone());
        self.tap = Some(tap.clone());
        tmux.send_line(&pane, &shell.open_master(&self.control_path))?;
        clock.sleep(Duration::from_secs(1));
        tmux.send_line(
            &pane,
            &format!(
                "sudo ethos_uhcpd.py --udp-ports {} {} {} {}",
                self.ports.csv(),
                sink,
                tap,
                subnet
            ),
        )?;

        let up = wait_for_predicate(clock.as_ref(), SINK_CHECK, |attempt| {
            let marker = format!("br-mark-{}-{}", clock.now(), attempt);
            tmux.send_line(&pane, &marker)?;
            tmux.send_line(&pane, "ifconfig")?;
            clock.sleep(Duration::from_secs(1));
            let capture = tmux.capture(&pane, 100)?;
            sink_verdict(&capture, &marker).map_err(|r| anyhow::Error::new(fail(r)))
        })?;
        match up {
            Some(()) => Ok(()),
            None => Err(fail("sink got no global address".to_owned()).into()),
        }
    }

    /// Dumps sink state after a run and reboots it. Returns the dump.
    pub fn diagnostics(&self, marker: &str) -> anyhow::Result<String> {
        let pane = self.pane.as_ref().context("border router not running")?;
        let Session { tmux, clock, .. } = &self.session;
        tmux.send_line(pane, marker)?;
        for cmd in ["ifconfig", "pktbuf", "ps", "6lo_frag"] {
            tmux.send_line(pane, cmd)?;
            clock.sleep(Duration::from_millis(500));
        }
        let capture = tmux.capture(pane, 1000)?;
        tmux.send_line(pane, "reboot")?;
        Ok(extract_br_log(&capture, marker))
    }

    /// Safe to call any number of times.
    pub fn stop(&mut self) {
        let pane = match self.pane.take() {
            Some(p) => p,
            None => return,
        };
        self.tap = None;
        let Session { shell, tmux, clock, .. } = &self.session;
        info!("stopping border router");
        for _ in 0..3 {
            if let Err(e) = tmux.interrupt(&pane) {
                warn!("interrupting border router failed: {}", e);
            }
            clock.sleep(Duration::from_secs(2));
        }
        if let Err(e) = shell.run_once("pkill -f ethos_tools") {
            debug!("pkill ethos_tools: {}", e);
        }
        shell.close_master(&self.control_path);
    }
}
