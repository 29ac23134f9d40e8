use std::{
    collections::{btree_map::Entry, BTreeMap},
    fs,
    net::Ipv6Addr,
    path::{Path, PathBuf},
    rc::Rc,
    time::Duration,
};

use anyhow::Context;
use rand::{rngs::StdRng, Rng};
use serde::Deserialize;

use crate::{
    descs::{env_value, FirmwareDesc, Globals, LinkLayer, Run, Transport},
    error::{ConfigurationError, ExperimentError},
    network::{archi, Network},
    testbed::{default_board, FirmwareBuild, Power, Testbed},
    utils::{
        serial::{Consoles, NodeConsole},
        wait_for_predicate, Retry, Session,
    },
};

use super::{
    border_router::BorderRouter,
    resolver::{ResolverEndpoint, DTLS_CLIENT_IDENTITY, DTLS_PSK},
};

const SHELL_TIMEOUT: Duration = Duration::from_secs(10);
const GLOBAL_WAIT_802154: Retry = Retry::new(3, Duration::from_secs(10));
const GLOBAL_WAIT_BLE: Retry = Retry::new(5, Duration::from_secs(30));
const RPL_WAIT: Retry = Retry::new(10, Duration::from_secs(3));
const INIT_RETRY: Retry = Retry::new(3, Duration::from_secs(1));
const OSCORE_RETRY: Retry = Retry::new(3, Duration::from_secs(1));
const QUERY_BULK_RETRY: Retry = Retry::new(3, Duration::from_millis(500));
const PROXY_RETRY: Retry = Retry::new(3, Duration::from_millis(500));
/// Granularity of the query delays, in ms per second.
const QUERY_RESOLUTION: f64 = 1000.0;
const DTLS_PORT: u16 = 5853;

/// `whitelist-«node».inc` content: the L2 addresses `node` may hear.
pub fn whitelist(network: &Network, node: &str) -> String {
    let mut out = String::from("#define L2_FILTER_WHITE_LIST { \\\n");
    for n in network.neighbors(node) {
        if let Some(addr) = network.l2addr(n) {
            out.push_str(&format!("    \"{}\", \\\n", addr));
        }
    }
    out.push_str("}\n");
    out
}

fn build_for(
    fw: &FirmwareDesc,
    node: &str,
    run: &Run,
    base: &Path,
) -> FirmwareBuild {
    let mut env: BTreeMap<String, String> = fw
        .env
        .iter()
        .map(|(k, v)| (k.clone(), env_value(v)))
        .collect();
    env.extend(run.env.iter().map(|(k, v)| (k.clone(), env_value(v))));
    FirmwareBuild {
        app: base.join(&fw.path),
        board: fw
            .board
            .clone()
            .unwrap_or_else(|| default_board(archi(node)).to_owned()),
        env,
        flashfile: fw.flashfile.as_ref().map(|f| base.join(f)),
    }
}

/// Builds every node's firmware and returns the image to flash per node.
///
/// Non-sink nodes get their own whitelist and bin directory. `firmwares`
/// maps onto them in edge list order, the last entry covering the rest.
pub fn prepare_firmware(
    testbed: &dyn Testbed,
    globals: &Globals,
    network: &Network,
    run: &Run,
    base: &Path,
) -> anyhow::Result<BTreeMap<String, PathBuf>> {
    let sink_fw = globals
        .sink_firmware
        .as_ref()
        .ok_or_else(|| ConfigurationError::invalid("globals without sink_firmware"))?;
    let mut builds = vec![(
        network.sink().to_owned(),
        build_for(sink_fw, network.sink(), run, base),
    )];

    for (i, node) in network.non_sink().into_iter().enumerate() {
        let fw = globals
            .firmwares
            .get(i)
            .or_else(|| globals.firmwares.last())
            .ok_or_else(|| ConfigurationError::invalid("globals without firmwares"))?;
        let mut build = build_for(fw, node, run, base);
        let wl_name = format!("whitelist-{}.inc", node);
        let wl_path = build.app.join(&wl_name);
        fs::write(&wl_path, whitelist(network, node))
            .with_context(|| format!("writing {}", wl_path.display()))?;
        let bindirbase = build.app.join(format!("{}-bin", node));
        build.env.insert("QUIETER".to_owned(), "1".to_owned());
        build.env.insert("WHITELIST_NAME".to_owned(), wl_name);
        build
            .env
            .insert("BINDIRBASE".to_owned(), bindirbase.to_string_lossy().into_owned());
        builds.push((node.to_owned(), build));
    }

    let mut elfs = BTreeMap::new();
    for (node, build) in builds {
        if build.flashfile.is_none() {
            testbed.build(&build)?;
        }
        elfs.insert(node, build.elf());
    }
    Ok(elfs)
}

/// Global address in RIOT `ifconfig` output.
pub fn global_addr(ifconfig: &str) -> Option<Ipv6Addr> {
    ifconfig
        .lines()
        .filter(|l| l.contains("scope: global"))
        .find_map(|l| {
            let rest = l.split_once("inet6 addr:")?.1;
            rest.split_whitespace().next()?.parse().ok()
        })
}

/// Preferred parent once the RPL instance is active.
pub fn rpl_parent(rpl: &str) -> Option<&str> {
    let active = rpl
        .lines()
        .any(|l| l.contains("instance table:") && l.contains("[X]"));
    if !active {
        return None;
    }
    let rest = rpl.split_once("parent [addr: ")?.1;
    let addr = rest.split(|c: char| c == ' ' || c == '|').next()?;
    (!addr.is_empty()).then_some(addr)
}

/// Whether `nib route` routes everything through `parent`.
pub fn default_route_via(nib: &str, parent: &str) -> bool {
    let via = format!("via {}", parent);
    nib.lines()
        .any(|l| l.trim_start().starts_with("default") && l.contains(&via))
}

/// Echo replies counted in `ping6` statistics, zero when there are none.
pub fn ping_replies(ping: &str) -> u64 {
    ping.lines()
        .flat_map(|l| l.split(", "))
        .find_map(|part| part.trim().strip_suffix(" packets received")?.parse().ok())
        .unwrap_or(0)
}

/// A `t;«id»` line shows the node sent a query.
pub fn query_sent(out: &str) -> bool {
    out.split_whitespace().any(|w| {
        w.strip_prefix("t;")
            .map_or(false, |id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
    })
}

/// One draw from Poisson(`lambda`). Large rates are split into chunks so the
/// product of uniforms stays representable.
pub fn poisson(rng: &mut impl Rng, lambda: f64) -> u64 {
    let mut remaining = lambda;
    let mut total = 0;
    while remaining > 0.0 {
        let chunk = remaining.min(500.0);
        remaining -= chunk;
        let limit = (-chunk).exp();
        let mut p: f64 = rng.gen();
        while p > limit {
            total += 1;
            p *= rng.gen::<f64>();
        }
    }
    total
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Algorithm {
    Number(i64),
    Name(String),
}

#[derive(Debug, Deserialize)]
struct OscoreSettings {
    algorithm: Algorithm,
    #[serde(rename = "sender-id_hex")]
    sender_id: String,
    #[serde(rename = "recipient-id_hex")]
    recipient_id: String,
    #[serde(rename = "common-iv_hex")]
    common_iv: String,
    #[serde(rename = "sender-key_hex")]
    sender_key: String,
    #[serde(rename = "recipient-key_hex")]
    recipient_key: String,
}

fn cose_algorithm(name: &str) -> Option<i64> {
    Some(match name {
        "A128GCM" => 1,
        "A192GCM" => 2,
        "A256GCM" => 3,
        "AES-CCM-16-64-128" => 10,
        "AES-CCM-16-64-256" => 11,
        "AES-CCM-64-64-128" => 12,
        "AES-CCM-64-64-256" => 13,
        "ChaCha20/Poly1305" => 24,
        "AES-CCM-16-128-128" => 30,
        "AES-CCM-16-128-256" => 31,
        "AES-CCM-64-128-128" => 32,
        "AES-CCM-64-128-256" => 33,
        _ => return None,
    })
}

/// Derived OSCORE security context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OscoreContext {
    algorithm: i64,
    sender_id: Vec<u8>,
    recipient_id: Vec<u8>,
    common_iv: Vec<u8>,
    sender_key: Vec<u8>,
    recipient_key: Vec<u8>,
}

impl OscoreContext {
    pub fn parse(json: &str) -> Result<Self, ConfigurationError> {
        let s: OscoreSettings = serde_json::from_str(json)
            .map_err(|e| ConfigurationError::invalid(format!("OSCORE settings: {}", e)))?;
        let algorithm = match s.algorithm {
            Algorithm::Number(n) => n,
            Algorithm::Name(name) => cose_algorithm(&name).ok_or_else(|| {
                ConfigurationError::invalid(format!("unknown OSCORE algorithm {}", name))
            })?,
        };
        let decode = |field: &str, v: &str| {
            hex::decode(v).map_err(|e| {
                ConfigurationError::invalid(format!("OSCORE settings: {}: {}", field, e))
            })
        };
        Ok(OscoreContext {
            algorithm,
            sender_id: decode("sender-id_hex", &s.sender_id)?,
            recipient_id: decode("recipient-id_hex", &s.recipient_id)?,
            common_iv: decode("common-iv_hex", &s.common_iv)?,
            sender_key: decode("sender-key_hex", &s.sender_key)?,
            recipient_key: decode("recipient-key_hex", &s.recipient_key)?,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let json = fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(&json)
    }

    /// The same context seen from the other end.
    pub fn swapped(self) -> Self {
        OscoreContext {
            sender_id: self.recipient_id,
            recipient_id: self.sender_id,
            sender_key: self.recipient_key,
            recipient_key: self.sender_key,
            ..self
        }
    }

    pub fn userctx(&self) -> String {
        format!(
            "userctx {} {} {} {} {} {}",
            self.algorithm,
            hex::encode(&self.sender_id),
            hex::encode(&self.recipient_id),
            hex::encode(&self.common_iv),
            hex::encode(&self.sender_key),
            hex::encode(&self.recipient_key)
        )
    }
}

/// Brings the radio nodes of one experiment into a measurable state.
pub struct NodeOrchestrator {
    session: Session,
    testbed: Rc<dyn Testbed>,
    consoles: Rc<dyn Consoles>,
    network: Network,
    exp_id: u64,
    link_layer: LinkLayer,
    oscore_settings: PathBuf,
    rng: StdRng,
    open: BTreeMap<String, Box<dyn NodeConsole>>,
}

impl NodeOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Session,
        testbed: Rc<dyn Testbed>,
        consoles: Rc<dyn Consoles>,
        network: Network,
        exp_id: u64,
        link_layer: LinkLayer,
        oscore_keydir: &Path,
        rng: StdRng,
    ) -> Self {
        NodeOrchestrator {
            session,
            testbed,
            consoles,
            network,
            exp_id,
            link_layer,
            oscore_settings: oscore_keydir.join("settings.json"),
            rng,
            open: BTreeMap::new(),
        }
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn flash(&self, elfs: &BTreeMap<String, PathBuf>) -> anyhow::Result<()> {
        for (node, elf) in elfs {
            self.testbed
                .flash(self.exp_id, self.network.site(), node, elf)
                .with_context(|| format!("flashing {}", node))?;
        }
        Ok(())
    }

    pub fn power_cycle(&self, node: &str) -> anyhow::Result<()> {
        let site = self.network.site();
        debug!("power cycling {}", self.network.uri(node));
        self.testbed.power(self.exp_id, site, node, Power::Stop)?;
        self.session.clock.sleep(Duration::from_secs(1));
        self.testbed.power(self.exp_id, site, node, Power::Start)?;
        self.session.clock.sleep(Duration::from_secs(1));
        Ok(())
    }

    fn console(&mut self, node: &str) -> anyhow::Result<&mut Box<dyn NodeConsole>> {
        Ok(match self.open.entry(node.to_owned()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let console = self.consoles.open(self.session.shell.destination(), node)?;
                e.insert(console)
            }
        })
    }

    fn cmd(&mut self, node: &str, line: &str, timeout: Duration) -> anyhow::Result<String> {
        let console = self.console(node)?;
        debug!("{}> {}", console.node(), line);
        Ok(console.cmd(line, timeout)?)
    }

    /// Consoles must be gone before the serial aggregator attaches.
    pub fn close_consoles(&mut self) {
        self.open.clear();
    }

    /// Everything between a fresh power cycle and a node waiting for
    /// `query_bulk exec`.
    pub fn prepare(
        &mut self,
        run: &Run,
        endpoint: &ResolverEndpoint,
        br: &mut BorderRouter,
    ) -> anyhow::Result<()> {
        let res = self.prepare_nodes(run, endpoint, br);
        self.close_consoles();
        res
    }

    fn prepare_nodes(
        &mut self,
        run: &Run,
        endpoint: &ResolverEndpoint,
        br: &mut BorderRouter,
    ) -> anyhow::Result<()> {
        let nodes: Vec<String> = self.network.non_sink().into_iter().map(str::to_owned).collect();
        for node in &nodes {
            self.power_cycle(node)?;
        }

        let mut addrs = BTreeMap::new();
        for node in &nodes {
            let addr = self.wait_for_global(node, br)?;
            self.cmd(node, "6ctx", SHELL_TIMEOUT)?;
            addrs.insert(node.clone(), addr);
        }
        for node in &nodes {
            self.wait_for_rpl(node)?;
        }

        let context = match run.transport()? {
            Transport::Oscore => Some(OscoreContext::load(&self.oscore_settings)?.swapped()),
            _ => None,
        };
        let sources: Vec<&String> = nodes.iter().filter(|n| self.network.is_source(n)).collect();
        for node in &sources {
            self.ping(node, endpoint.host())?;
            self.init_transport(node, endpoint)?;
            if let Some(ctx) = &context {
                self.install_oscore(node, ctx)?;
            }
            let delays = self.draw_delays(run);
            self.load_delays(node, &delays)?;
        }

        if run.proxied() {
            for node in &sources {
                self.configure_proxy(node, &addrs)?;
            }
        }
        info!("{} nodes ready", nodes.len());
        Ok(())
    }

    fn poll_global(&mut self, node: &str, retry: Retry) -> anyhow::Result<Option<Ipv6Addr>> {
        let clock = self.session.clock.clone();
        wait_for_predicate(clock.as_ref(), retry, |_| {
            Ok(global_addr(&self.cmd(node, "ifconfig", SHELL_TIMEOUT)?))
        })
    }

    /// On 802.15.4 a node stuck without address gets one more round after a
    /// border router restart and a reboot.
    pub fn wait_for_global(&mut self, node: &str, br: &mut BorderRouter) -> anyhow::Result<Ipv6Addr> {
        let retry = match self.link_layer {
            LinkLayer::Ieee802154 => GLOBAL_WAIT_802154,
            LinkLayer::Ble => GLOBAL_WAIT_BLE,
        };
        if let Some(addr) = self.poll_global(node, retry)? {
            debug!("{} has {}", node, addr);
            return Ok(addr);
        }
        if self.link_layer == LinkLayer::Ieee802154 {
            warn!("{} has no global address, restarting border router", node);
            br.restart()?;
            self.cmd(node, "reboot", SHELL_TIMEOUT)?;
            if let Some(addr) = self.poll_global(node, retry)? {
                return Ok(addr);
            }
        }
        Err(ExperimentError::NoGlobalAddress {
            node: node.to_owned(),
        }
        .into())
    }

    pub fn wait_for_rpl(&mut self, node: &str) -> anyhow::Result<()> {
        let clock = self.session.clock.clone();
        let parent = wait_for_predicate(clock.as_ref(), RPL_WAIT, |_| {
            let out = self.cmd(node, "rpl", SHELL_TIMEOUT)?;
            Ok(rpl_parent(&out).map(str::to_owned))
        })?;
        let parent = parent.ok_or_else(|| ExperimentError::Convergence {
            node: node.to_owned(),
            reason: "no RPL parent".to_owned(),
        })?;
        let nib = self.cmd(node, "nib route", SHELL_TIMEOUT)?;
        if !default_route_via(&nib, &parent) {
            return Err(ExperimentError::Convergence {
                node: node.to_owned(),
                reason: format!("no default route via {}", parent),
            }
            .into());
        }
        debug!("{} routes via {}", node, parent);
        Ok(())
    }

    fn ping(&mut self, node: &str, addr: Ipv6Addr) -> anyhow::Result<()> {
        let out = self.cmd(node, &format!("ping6 -c 3 -i 333 {}", addr), SHELL_TIMEOUT)?;
        if ping_replies(&out) == 0 {
            error!("resolver is unreachable from {}", node);
            return Err(ExperimentError::ResolverUnreachable {
                node: node.to_owned(),
                addr: addr.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn init_transport(&mut self, node: &str, endpoint: &ResolverEndpoint) -> anyhow::Result<()> {
        let line = format!(
            "init {} {} {} {}",
            endpoint, DTLS_PORT, DTLS_CLIENT_IDENTITY, DTLS_PSK
        );
        let timeout = if endpoint.transport() == Transport::Dtls {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(1)
        };
        let clock = self.session.clock.clone();
        let ok = wait_for_predicate(clock.as_ref(), INIT_RETRY, |_| {
            Ok(self.cmd(node, &line, timeout)?.contains("Success").then_some(()))
        })?;
        ok.ok_or_else(|| {
            ExperimentError::TransportInit {
                node: node.to_owned(),
                endpoint: endpoint.to_string(),
            }
            .into()
        })
    }

    fn install_oscore(&mut self, node: &str, ctx: &OscoreContext) -> anyhow::Result<()> {
        let line = ctx.userctx();
        let clock = self.session.clock.clone();
        let ok = wait_for_predicate(clock.as_ref(), OSCORE_RETRY, |_| {
            let out = self.cmd(node, &line, SHELL_TIMEOUT)?;
            Ok(out.contains("Successfully added user context").then_some(()))
        })?;
        ok.ok_or_else(|| {
            ExperimentError::Oscore {
                node: node.to_owned(),
            }
            .into()
        })
    }

    /// Query delays in ms for one node.
    pub fn draw_delays(&mut self, run: &Run) -> Vec<u64> {
        let lambda = QUERY_RESOLUTION / run.avg_queries_per_sec();
        (0..run.dns_count())
            .map(|_| poisson(&mut self.rng, lambda))
            .collect()
    }

    fn load_delays(&mut self, node: &str, delays: &[u64]) -> anyhow::Result<()> {
        let clock = self.session.clock.clone();
        for &ms in delays {
            let expected = format!("Will wait {} ms", ms);
            let line = format!("query_bulk add {}", ms);
            let ok = wait_for_predicate(clock.as_ref(), QUERY_BULK_RETRY, |_| {
                Ok(self.cmd(node, &line, SHELL_TIMEOUT)?.contains(&expected).then_some(()))
            })?;
            if ok.is_none() {
                return Err(ExperimentError::SleepSchedule {
                    node: node.to_owned(),
                    value: ms,
                }
                .into());
            }
        }
        debug!("{} query delays loaded on {}", delays.len(), node);
        Ok(())
    }

    fn configure_proxy(
        &mut self,
        node: &str,
        addrs: &BTreeMap<String, Ipv6Addr>,
    ) -> anyhow::Result<()> {
        let proxy_err = |reason: String| ExperimentError::Proxy {
            node: node.to_owned(),
            reason,
        };
        let proxy = self
            .network
            .nearest_proxy(node)
            .ok_or_else(|| proxy_err("no proxy reachable".to_owned()))?;
        let addr = addrs
            .get(proxy)
            .ok_or_else(|| proxy_err(format!("no address for {}", proxy)))?;
        let uri = format!("coap://[{}]/", addr);

        let line = format!("proxy {}", uri);
        let expected = format!("Configured proxy {}", uri);
        let clock = self.session.clock.clone();
        let ok = wait_for_predicate(clock.as_ref(), PROXY_RETRY, |_| {
            Ok(self.cmd(node, &line, SHELL_TIMEOUT)?.contains(&expected).then_some(()))
        })?;
        if ok.is_none() {
            return Err(proxy_err(format!("unable to configure proxy {}", uri)).into());
        }

        let out = self.cmd(node, "query example.org inet6 fetch", Duration::from_secs(60))?;
        if !query_sent(&out) {
            return Err(proxy_err("warm-up query was not sent".to_owned()).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use rand::SeedableRng;

    use super::*;
    use crate::{
        controllers::resolver::BASELINE_PORTS,
        descs::Method,
        network::NetworkDesc,
        utils::mock::{healthy_node, session, MockClock, MockConsoles, MockRunner, MockTestbed},
    };

    const SETTINGS: &str = r#"{
        "algorithm": "AES-CCM-16-64-128",
        "sender-id_hex": "01",
        "recipient-id_hex": "",
        "common-iv_hex": "4622d4dd6d944168eefb54987c",
        "sender-key_hex": "f0910ed7295e6ad4b54fc793154302ff",
        "recipient-key_hex": "ffb14e093c94c9cac9471648b4f98710"
    }"#;

    fn network(yaml: &str) -> Network {
        let desc: NetworkDesc = serde_yaml::from_str(yaml).unwrap();
        let mut l2addrs = BTreeMap::new();
        for (a, b) in &desc.edgelist {
            for n in [a, b] {
                l2addrs.insert(n.clone(), format!("02:00:00:00:00:00:00:0{}", crate::network::number(n)));
            }
        }
        Network::new(&desc, &l2addrs).unwrap()
    }

    fn line() -> Network {
        network("{site: grenoble, sink: m3-1, edgelist: [[m3-1, m3-2], [m3-2, m3-3]]}")
    }

    fn run(yaml: &str) -> Run {
        serde_yaml::from_str(yaml).unwrap()
    }

    struct Rig {
        runner: Rc<MockRunner>,
        clock: Rc<MockClock>,
        consoles: Rc<MockConsoles>,
        testbed: Rc<MockTestbed>,
        keydir: tempfile::TempDir,
    }

    impl Rig {
        fn new(consoles: Rc<MockConsoles>) -> Self {
            let runner = MockRunner::new();
            runner.on("ip -6 route", "");
            runner.on_pane(|l| {
                (l == "ifconfig").then(|| "inet6 addr: 2001:db8::1  scope: global\n".to_owned())
            });
            runner.on_pane(|l| {
                l.starts_with("br-mark").then(|| format!("command not found: {}\n", l))
            });
            let keydir = tempfile::tempdir().unwrap();
            fs::write(keydir.path().join("settings.json"), SETTINGS).unwrap();
            Rig {
                runner,
                clock: Rc::new(MockClock::new(0)),
                consoles,
                testbed: MockTestbed::new(1),
                keydir,
            }
        }

        fn nodes(&self, network: Network, link_layer: LinkLayer) -> NodeOrchestrator {
            NodeOrchestrator::new(
                session(&self.runner, &self.clock),
                self.testbed.clone(),
                self.consoles.clone(),
                network,
                42,
                link_layer,
                self.keydir.path(),
                StdRng::seed_from_u64(7),
            )
        }

        fn br(&self) -> BorderRouter {
            BorderRouter::new(
                session(&self.runner, &self.clock),
                BASELINE_PORTS,
                "/tmp/.ssh-br".to_owned(),
            )
        }
    }

    fn endpoint(t: Transport) -> ResolverEndpoint {
        ResolverEndpoint::new(t, "2001:db8::2".parse().unwrap(), &BASELINE_PORTS, Some(Method::Fetch))
    }

    #[test]
    fn parsers() {
        let ifconfig = healthy_node("m3-3", "ifconfig");
        assert_eq!(global_addr(&ifconfig), "2001:db8:0:1::3".parse().ok());
        assert_eq!(global_addr("inet6 addr: fe80::3  scope: link\n"), None);

        let rpl = healthy_node("m3-3", "rpl");
        assert_eq!(rpl_parent(&rpl), Some("fe80::2"));
        assert_eq!(rpl_parent("instance table:\t[ ]\t[ ]\n"), None);

        assert!(default_route_via(&healthy_node("m3-3", "nib"), "fe80::2"));
        assert!(!default_route_via("2001:db8::/64 dev #6\n", "fe80::2"));

        assert_eq!(ping_replies(&healthy_node("m3-3", "ping6")), 3);
        assert_eq!(ping_replies("3 packets transmitted, 0 packets received, 100% packet loss"), 0);
        assert_eq!(ping_replies("error: timeout"), 0);

        assert!(query_sent("query example.org\nt;42 \n> "));
        assert!(!query_sent("t; 42\nt;x1"));
    }

    #[test]
    fn whitelist_lists_neighbours() {
        assert_eq!(
            whitelist(&line(), "m3-2"),
            "#define L2_FILTER_WHITE_LIST { \\\n    \"02:00:00:00:00:00:00:01\", \\\n    \"02:00:00:00:00:00:00:03\", \\\n}\n"
        );
    }

    #[test]
    fn poisson_mean_is_close() {
        let mut rng = StdRng::seed_from_u64(3);
        for lambda in [100.0, 1000.0] {
            let n = 400;
            let sum: u64 = (0..n).map(|_| poisson(&mut rng, lambda)).sum();
            let mean = sum as f64 / n as f64;
            assert!((mean - lambda).abs() < lambda * 0.15, "mean {} for {}", mean, lambda);
        }
    }

    #[test]
    fn oscore_context_is_swapped() {
        let ctx = OscoreContext::parse(SETTINGS).unwrap().swapped();
        assert_eq!(
            ctx.userctx(),
            "userctx 10  01 4622d4dd6d944168eefb54987c ffb14e093c94c9cac9471648b4f98710 f0910ed7295e6ad4b54fc793154302ff"
        );
        assert!(OscoreContext::parse(&SETTINGS.replace("\"01\"", "\"0g\"")).is_err());
        let numeric = SETTINGS.replace("\"AES-CCM-16-64-128\"", "12");
        assert!(OscoreContext::parse(&numeric).unwrap().userctx().starts_with("userctx 12 "));
    }

    #[test]
    fn firmware_per_node() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("apps/requester")).unwrap();
        let globals: Globals = serde_yaml::from_str(
            "{sink_firmware: {path: apps/border-router}, firmwares: [{path: apps/requester, env: {DNS_CACHE: true}}]}",
        )
        .unwrap();
        let testbed = MockTestbed::new(1);
        let elfs = prepare_firmware(
            testbed.as_ref(),
            &globals,
            &line(),
            &run("{env: {DNS_TRANSPORT: udp}, wait: 1}"),
            dir.path(),
        )
        .unwrap();

        let app = dir.path().join("apps/requester");
        assert_eq!(
            testbed.calls(),
            vec![
                format!("build {} -", dir.path().join("apps/border-router").display()),
                format!("build {} whitelist-m3-2.inc", app.display()),
                format!("build {} whitelist-m3-3.inc", app.display()),
            ]
        );
        assert_eq!(elfs["m3-3"], app.join("m3-3-bin/iotlab-m3/requester.elf"));
        assert_eq!(
            elfs["m3-1"],
            dir.path().join("apps/border-router/bin/iotlab-m3/border-router.elf")
        );
        let wl = fs::read_to_string(app.join("whitelist-m3-3.inc")).unwrap();
        assert!(wl.contains("\"02:00:00:00:00:00:00:02\""));
    }

    #[test]
    fn healthy_udp_preparation() {
        let rig = Rig::new(MockConsoles::healthy());
        let mut nodes = rig.nodes(line(), LinkLayer::Ieee802154);
        let mut br = rig.br();

        let r = run("{env: {DNS_TRANSPORT: udp, DNS_COUNT: 20}, wait: 1, args: {avg_queries_per_sec: 10}}");
        nodes.prepare(&r, &endpoint(Transport::Udp), &mut br).unwrap();

        let sent = rig.consoles.sent_to("m3-3");
        assert_eq!(sent[0], "ifconfig");
        assert_eq!(sent[1], "6ctx");
        assert!(sent.contains(&"ping6 -c 3 -i 333 2001:db8::2".to_owned()));
        assert!(sent.contains(&"init [2001:db8::2]:5300 5853 Client_identity secretPSK".to_owned()));
        assert_eq!(sent.iter().filter(|l| l.starts_with("query_bulk add ")).count(), 20);
        assert!(!sent.iter().any(|l| l.starts_with("userctx")));
        assert_eq!(rig.consoles.live(), 0);
        assert_eq!(rig.testbed.count("power 42 m3-2 Stop"), 1);
        assert_eq!(rig.testbed.count("power 42 m3-1"), 0);
    }

    #[test]
    fn oscore_context_installed_on_sources() {
        let rig = Rig::new(MockConsoles::healthy());
        let mut nodes = rig.nodes(line(), LinkLayer::Ieee802154);
        let mut br = rig.br();

        let r = run("{env: {DNS_TRANSPORT: oscore, DNS_COUNT: 2}, wait: 1}");
        nodes.prepare(&r, &endpoint(Transport::Oscore), &mut br).unwrap();

        for node in ["m3-2", "m3-3"] {
            let sent = rig.consoles.sent_to(node);
            let init = sent.iter().position(|l| l.starts_with("init coap://")).unwrap();
            let ctx = sent.iter().position(|l| l.starts_with("userctx 10  01 ")).unwrap();
            let bulk = sent.iter().position(|l| l.starts_with("query_bulk add")).unwrap();
            assert!(init < ctx && ctx < bulk);
        }
    }

    #[test]
    fn unreachable_resolver_fails() {
        let consoles = MockConsoles::new(|node, line| {
            if line.starts_with("ping6") {
                "3 packets transmitted, 0 packets received, 100% packet loss\n".to_owned()
            } else {
                healthy_node(node, line)
            }
        });
        let rig = Rig::new(consoles);
        let mut nodes = rig.nodes(line(), LinkLayer::Ieee802154);
        let mut br = rig.br();

        let err = nodes
            .prepare(&run("{env: {DNS_TRANSPORT: udp}, wait: 1}"), &endpoint(Transport::Udp), &mut br)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExperimentError>(),
            Some(ExperimentError::ResolverUnreachable { .. })
        ));
        assert_eq!(rig.consoles.live(), 0);
    }

    #[test]
    fn dtls_init_gets_three_tries() {
        let consoles = MockConsoles::new(|node, line| {
            if line.starts_with("init") {
                "error: handshake timeout\n".to_owned()
            } else {
                healthy_node(node, line)
            }
        });
        let rig = Rig::new(consoles);
        let mut nodes = rig.nodes(line(), LinkLayer::Ieee802154);
        let mut br = rig.br();

        let err = nodes
            .prepare(&run("{env: {DNS_TRANSPORT: dtls}, wait: 1}"), &endpoint(Transport::Dtls), &mut br)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExperimentError>(),
            Some(ExperimentError::TransportInit { .. })
        ));
        let inits = rig.consoles.sent_to("m3-2").iter().filter(|l| l.starts_with("init")).count();
        assert_eq!(inits, 3);
    }

    #[test]
    fn only_dtls_init_waits_for_handshake() {
        let rig = Rig::new(MockConsoles::healthy());
        let mut br = rig.br();

        let mut nodes = rig.nodes(line(), LinkLayer::Ieee802154);
        nodes
            .prepare(&run("{env: {DNS_TRANSPORT: coaps, DNS_COUNT: 1}, wait: 1}"), &endpoint(Transport::Coaps), &mut br)
            .unwrap();
        assert_eq!(rig.consoles.timeouts("init coaps://"), vec![Duration::from_secs(1); 2]);

        let mut nodes = rig.nodes(line(), LinkLayer::Ieee802154);
        nodes
            .prepare(&run("{env: {DNS_TRANSPORT: dtls, DNS_COUNT: 1}, wait: 1}"), &endpoint(Transport::Dtls), &mut br)
            .unwrap();
        assert_eq!(rig.consoles.timeouts("init [2001:db8::2]:8530"), vec![Duration::from_secs(30); 2]);
    }

    #[test]
    fn missing_address_restarts_border_router_once() {
        let consoles = MockConsoles::new(|node, line| {
            if node == "m3-3" && line == "ifconfig" {
                "inet6 addr: fe80::3  scope: link\n".to_owned()
            } else {
                healthy_node(node, line)
            }
        });
        let rig = Rig::new(consoles);
        let mut nodes = rig.nodes(line(), LinkLayer::Ieee802154);
        let mut br = rig.br();
        br.start(nodes.network(), "2001:db8::/48").unwrap();

        let err = nodes
            .prepare(&run("{env: {DNS_TRANSPORT: udp}, wait: 1}"), &endpoint(Transport::Udp), &mut br)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExperimentError>(),
            Some(ExperimentError::NoGlobalAddress { .. })
        ));
        let sent = rig.consoles.sent_to("m3-3");
        assert_eq!(sent.iter().filter(|l| *l == "ifconfig").count(), 6);
        assert_eq!(sent.iter().filter(|l| *l == "reboot").count(), 1);
        assert_eq!(rig.runner.count("pkill -f ethos_tools"), 1);
    }

    #[test]
    fn ble_waits_longer_without_restart() {
        let consoles = MockConsoles::new(|node, line| {
            if line == "ifconfig" {
                String::new()
            } else {
                healthy_node(node, line)
            }
        });
        let rig = Rig::new(consoles);
        let mut nodes = rig.nodes(line(), LinkLayer::Ble);
        let mut br = rig.br();

        assert!(nodes.wait_for_global("m3-2", &mut br).is_err());
        let ifconfigs = rig.consoles.sent_to("m3-2").len();
        assert_eq!(ifconfigs, 5);
        assert_eq!(
            rig.clock.sleeps().iter().filter(|d| **d == Duration::from_secs(30)).count(),
            4
        );
    }

    #[test]
    fn proxies_configured_with_nearest_proxy() {
        let consoles = MockConsoles::healthy();
        let rig = Rig::new(consoles);
        let net = network(
            "{site: grenoble, sink: m3-1, proxies: [{name: m3-2}], edgelist: [[m3-1, m3-2], [m3-2, m3-3], [m3-2, m3-4]]}",
        );
        let mut nodes = rig.nodes(net, LinkLayer::Ieee802154);
        let mut br = rig.br();

        let r = run("{env: {DNS_TRANSPORT: coap, DNS_COUNT: 1}, wait: 1, args: {proxied: true}}");
        nodes.prepare(&r, &endpoint(Transport::Coap), &mut br).unwrap();

        for source in ["m3-3", "m3-4"] {
            let sent = rig.consoles.sent_to(source);
            assert!(sent.contains(&"proxy coap://[2001:db8:0:1::2]/".to_owned()));
            assert_eq!(sent.last().map(String::as_str), Some("query example.org inet6 fetch"));
        }
        let proxy = rig.consoles.sent_to("m3-2");
        assert!(!proxy.iter().any(|l| l.starts_with("init") || l.starts_with("query_bulk")));
    }

    #[test]
    fn silent_warm_up_fails() {
        let consoles = MockConsoles::new(|node, line| {
            if line.starts_with("query ") {
                "error: no response\n".to_owned()
            } else {
                healthy_node(node, line)
            }
        });
        let rig = Rig::new(consoles);
        let net = network(
            "{site: grenoble, sink: m3-1, proxies: [{name: m3-2}], edgelist: [[m3-1, m3-2], [m3-2, m3-3]]}",
        );
        let mut nodes = rig.nodes(net, LinkLayer::Ieee802154);
        let mut br = rig.br();

        let r = run("{env: {DNS_TRANSPORT: coap, DNS_COUNT: 1}, wait: 1, args: {proxied: true}}");
        let err = nodes.prepare(&r, &endpoint(Transport::Coap), &mut br).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExperimentError>(),
            Some(ExperimentError::Proxy { .. })
        ));
    }
}
