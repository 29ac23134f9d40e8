//! Run driver: takes groups off the ledger, reserves them on the testbed and
//! walks every run through
//! `pre_experiment -> (pre_run -> run -> post_run)+ -> post_experiment`.

use std::{
    collections::BTreeMap,
    fs,
    net::Ipv6Addr,
    path::{Path, PathBuf},
    rc::Rc,
    time::Duration,
};

use anyhow::Context as _;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    controllers::{
        border_router::BorderRouter,
        nodes::{prepare_firmware, NodeOrchestrator},
        resolver::{bind_address, check_virtualenv, PortTable, Resolver, OSCORE_KEYDIR},
        sniffer::Sniffer,
    },
    descs::{run_stem, store::DescriptionStore, Globals, Group, LinkLayer, NameContext, Run},
    error::{ConfigurationError, ExperimentError},
    network::Network,
    testbed::{Reservation, Testbed},
    utils::{
        artifact_path,
        command::CommandRunner,
        results_uploader::ResultHandler,
        serial::Consoles,
        ssh::{control_path, RemoteShell},
        tmux::{Pane, Tmux},
        Clock, Session,
    },
};

/// Reservation length when neither the group nor the globals set one.
pub const DEFAULT_DURATION_MIN: u64 = 60;
const COOL_DOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Fresh,
    PrePreparing,
    NodesReady,
    Running,
    Draining,
    Done,
    Rescheduled,
}

/// Everything the lifecycle hooks of one experiment hand to each other.
#[derive(Debug)]
pub struct Context {
    pub exp_id: u64,
    pub link_layer: LinkLayer,
    pub non_sink: Vec<String>,
    pub border_router: Option<Pane>,
    pub tap: Option<String>,
    pub resolver: Option<Pane>,
    pub pcap: Option<PathBuf>,
    pub log: Option<PathBuf>,
    pub run_pane: Option<Pane>,
    state: RunState,
}

impl Context {
    fn new(exp_id: u64, link_layer: LinkLayer, network: &Network) -> Self {
        Context {
            exp_id,
            link_layer,
            non_sink: network.non_sink().into_iter().map(str::to_owned).collect(),
            border_router: None,
            tap: None,
            resolver: None,
            pcap: None,
            log: None,
            run_pane: None,
            state: RunState::Fresh,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn enter(&mut self, state: RunState) {
        debug!("experiment {}: {:?} -> {:?}", self.exp_id, self.state, state);
        self.state = state;
    }
}

/// Command typed into the serial aggregator, broadcast to every node.
pub fn experiment_command(run: &Run) -> String {
    let mut cmd = format!(
        "query_bulk exec id.exp.example.org {}",
        run.record().family()
    );
    if let Some(method) = run.args.method {
        cmd.push_str(&format!(" {}", method));
    }
    if run.args.max_age_mode.is_some() {
        cmd.push_str(" 8");
    }
    cmd
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Fatal,
    Reschedule,
    Skip,
}

fn classify(err: &anyhow::Error, link_layer: LinkLayer) -> Verdict {
    if err.downcast_ref::<ConfigurationError>().is_some() {
        return Verdict::Fatal;
    }
    if link_layer == LinkLayer::Ble {
        return Verdict::Reschedule;
    }
    match err.downcast_ref::<ExperimentError>() {
        Some(e) if e.is_border_router() => Verdict::Reschedule,
        _ => Verdict::Skip,
    }
}

/// Command line knobs.
#[derive(Debug, Clone)]
pub struct Settings {
    pub virtualenv: String,
    pub descs: PathBuf,
    pub limit_unscheduled: Option<usize>,
    pub exp_id: Option<u64>,
    pub verbosity: String,
    pub ports: PortTable,
    /// `DATA_PATH`
    pub data_path: Option<PathBuf>,
}

/// The outside world as seen by the dispatcher.
pub struct Backend {
    pub runner: Rc<dyn CommandRunner>,
    pub clock: Rc<dyn Clock>,
    pub testbed: Rc<dyn Testbed>,
    pub consoles: Rc<dyn Consoles>,
    pub results: Box<dyn ResultHandler>,
    /// Frontend login, `IOTLAB_USER` or `USER` when unset.
    pub user: Option<String>,
    /// `SSH_AUTH_SOCK` and `SSH_AGENT_PID` to re-export in panes.
    pub agent: Option<(String, String)>,
    pub rng: StdRng,
}

struct Controllers {
    br: BorderRouter,
    resolver: Resolver,
    sniffer: Sniffer,
    nodes: NodeOrchestrator,
}

enum RunOutcome {
    Done(Vec<PathBuf>),
    Interrupted,
}

pub struct Dispatcher {
    settings: Settings,
    backend: Backend,
    store: DescriptionStore,
    network: Network,
    session: Session,
    base_dir: PathBuf,
    descs_stem: String,
    bind_address: Option<Ipv6Addr>,
    /// Images built while scheduling, by experiment id.
    firmware: Option<(u64, BTreeMap<String, PathBuf>)>,
}

impl Dispatcher {
    pub fn new(settings: Settings, backend: Backend) -> anyhow::Result<Self> {
        let store = DescriptionStore::load(&settings.descs, settings.limit_unscheduled)?;
        let nodes = store
            .globals()
            .nodes
            .as_ref()
            .ok_or_else(|| ConfigurationError::invalid("globals.nodes is missing"))?;
        let network = Network::new(&nodes.network, &nodes.l2addrs)?;

        let descs_stem = settings
            .descs
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "descs".to_owned());
        let base_dir = settings
            .descs
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        // paths typed into panes must not depend on the cwd
        let base_dir = base_dir
            .canonicalize()
            .map_err(|source| ConfigurationError::Io { path: base_dir.clone(), source })?;

        let shell = match &backend.user {
            Some(user) => RemoteShell::with_user(backend.runner.clone(), user, network.site()),
            None => RemoteShell::new(backend.runner.clone(), network.site()),
        };
        let tmux = Tmux::new(backend.runner.clone(), &format!("dispatch-{}", descs_stem))
            .with_agent(backend.agent.clone());
        let session = Session {
            runner: backend.runner.clone(),
            shell: Rc::new(shell),
            tmux: Rc::new(tmux),
            clock: backend.clock.clone(),
        };
        check_virtualenv(&session.shell, &settings.virtualenv)?;

        Ok(Dispatcher {
            settings,
            backend,
            store,
            network,
            session,
            base_dir,
            descs_stem,
            bind_address: None,
            firmware: None,
        })
    }

    /// Absolute results directory. `DATA_PATH` wins, relative `results_dir`
    /// entries are taken relative to the description file.
    fn data_dir(&self) -> anyhow::Result<PathBuf> {
        let dir = match (&self.settings.data_path, &self.store.globals().results_dir) {
            (Some(path), _) => path.clone(),
            (None, Some(dir)) => self.base_dir.join(dir),
            (None, None) => self.base_dir.join("results"),
        };
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let dir = dir
            .canonicalize()
            .map_err(|source| ConfigurationError::Io { path: dir, source })?;
        Ok(dir)
    }

    /// Works through the ledger until nothing is left or the operator
    /// interrupts.
    pub fn run(&mut self) -> anyhow::Result<()> {
        if let Some(exp_id) = self.settings.exp_id {
            if !self.store.assign(exp_id)? {
                info!("nothing to assign to experiment {}", exp_id);
            }
        }

        while !self.backend.clock.interrupted() {
            let exp_id = match self.next_experiment()? {
                Some(id) => id,
                None => break,
            };
            self.run_experiment(exp_id)?;
        }

        if self.backend.clock.interrupted() {
            info!("interrupted, leaving the remaining runs in {}", self.store.path().display());
        } else {
            info!(
                "no more runs to dispatch from {} ({} left in the file)",
                self.store.path().display(),
                self.store.descriptions().run_count()
            );
        }
        Ok(())
    }

    /// A running experiment with runs left, reserving one when needed.
    fn next_experiment(&mut self) -> anyhow::Result<Option<u64>> {
        loop {
            if self.backend.clock.interrupted() {
                return Ok(None);
            }
            for exp_id in self.store.scheduled_ids() {
                match self.backend.testbed.wait_running(exp_id) {
                    Ok(()) => return Ok(Some(exp_id)),
                    Err(e) => {
                        warn!("experiment {} is not running: {:#}", exp_id, e);
                        self.store.reschedule(exp_id)?;
                    }
                }
            }

            if let Some(group) = self.store.next_unscheduled() {
                info!("reserving nodes for {} runs", group.runs.len());
            }
            let globals = self.store.globals().clone();
            let testbed = self.backend.testbed.clone();
            let network = &self.network;
            let base_dir = &self.base_dir;
            let mut built = None;
            let scheduled = self.store.schedule_with(|group| {
                let (exp_id, elfs) = reserve(testbed.as_ref(), &globals, network, base_dir, group)?;
                built = Some(elfs);
                Ok(exp_id)
            })?;
            match scheduled {
                Some(exp_id) => {
                    if let Some(elfs) = built {
                        self.firmware = Some((exp_id, elfs));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    fn stop_experiment(&self, exp_id: u64) {
        _ = self
            .backend
            .testbed
            .stop(exp_id)
            .inspect_err(|e| warn!("stopping experiment {} failed: {:#}", exp_id, e));
    }

    fn reschedule(&mut self, exp_id: u64) -> anyhow::Result<()> {
        self.store.reschedule(exp_id)?;
        self.stop_experiment(exp_id);
        info!("cooling down for {} s", COOL_DOWN.as_secs());
        self.backend.clock.sleep(COOL_DOWN);
        Ok(())
    }

    fn run_experiment(&mut self, exp_id: u64) -> anyhow::Result<()> {
        let globals = self.store.globals().clone();
        let first = match self.store.group(exp_id).and_then(|g| g.runs.first()) {
            Some(run) => run.merged(&globals),
            None => {
                self.stop_experiment(exp_id);
                self.store.finish(exp_id)?;
                return Ok(());
            }
        };
        let link_layer = first.link_layer();
        info!("running experiment {} on {}", exp_id, link_layer);

        let mut ctx = Context::new(exp_id, link_layer, &self.network);
        let mut parts = self.controllers(exp_id, link_layer);

        /* pre_experiment */
        let pre = self.pre_experiment(&mut parts, &mut ctx, &globals, &first);
        if let Err(e) = pre {
            self.post_experiment(&mut parts);
            if self.backend.clock.interrupted() {
                warn!("interrupted while starting experiment {}: {:#}", exp_id, e);
                return Ok(());
            }
            if classify(&e, ctx.link_layer) == Verdict::Fatal {
                return Err(e);
            }
            error!("experiment {} failed to start: {:#}", exp_id, e);
            ctx.enter(RunState::Rescheduled);
            return self.reschedule(exp_id);
        }

        let mut cursor = self.store.consume(exp_id);
        let mut reschedule = false;
        while let Some(run) = self.store.current(&cursor) {
            let run = run.merged(&globals);
            if self.backend.clock.interrupted() {
                break;
            }
            ctx.enter(RunState::Fresh);
            match self.execute_run(&mut parts, &mut ctx, &globals, &run) {
                Ok(RunOutcome::Done(artifacts)) => {
                    self.store.complete(&cursor)?;
                    ctx.enter(RunState::Done);
                    debug!("run of experiment {} complete", cursor.exp_id());
                    for path in artifacts {
                        self.backend.results.handle_result(&path);
                    }
                }
                Ok(RunOutcome::Interrupted) => break,
                Err(_) if self.backend.clock.interrupted() => break,
                Err(e) => match classify(&e, run.link_layer()) {
                    Verdict::Fatal => {
                        self.post_experiment(&mut parts);
                        return Err(e);
                    }
                    Verdict::Reschedule => {
                        error!("run failed, rescheduling experiment {}: {:#}", exp_id, e);
                        ctx.enter(RunState::Rescheduled);
                        reschedule = true;
                        break;
                    }
                    Verdict::Skip => {
                        warn!("run failed while {:?}, skipping it: {:#}", ctx.state(), e);
                        cursor.skip();
                    }
                },
            }
        }

        /* post_experiment */
        self.post_experiment(&mut parts);
        if self.backend.clock.interrupted() {
            return Ok(());
        }
        let left = self.store.group(exp_id).map_or(0, |g| g.runs.len());
        if reschedule || left > 0 {
            if !reschedule {
                warn!("{} runs of experiment {} failed", left, exp_id);
            }
            return self.reschedule(exp_id);
        }
        self.stop_experiment(exp_id);
        self.store.finish(exp_id)?;
        Ok(())
    }

    fn controllers(&mut self, exp_id: u64, link_layer: LinkLayer) -> Controllers {
        let site = self.network.site().to_owned();
        let path = |role: &str| control_path(&site, role, &self.descs_stem, exp_id);
        let br = BorderRouter::new(self.session.clone(), self.settings.ports, path("br"));
        let resolver = Resolver::new(
            self.session.clone(),
            &self.settings.virtualenv,
            &self.settings.verbosity,
            self.settings.ports,
            path("resolver"),
        );
        let seed = self.backend.rng.gen();
        let nodes = NodeOrchestrator::new(
            self.session.clone(),
            self.backend.testbed.clone(),
            self.backend.consoles.clone(),
            self.network.clone(),
            exp_id,
            link_layer,
            &self.base_dir.join(OSCORE_KEYDIR),
            StdRng::seed_from_u64(seed),
        );
        Controllers {
            br,
            resolver,
            sniffer: Sniffer::new(self.session.clone()),
            nodes,
        }
    }

    fn firmware_for(&mut self, exp_id: u64, globals: &Globals, run: &Run) -> anyhow::Result<BTreeMap<String, PathBuf>> {
        match self.firmware.take() {
            Some((id, elfs)) if id == exp_id => Ok(elfs),
            _ => prepare_firmware(
                self.backend.testbed.as_ref(),
                globals,
                &self.network,
                run,
                &self.base_dir,
            ),
        }
    }

    fn pre_experiment(
        &mut self,
        parts: &mut Controllers,
        ctx: &mut Context,
        globals: &Globals,
        first: &Run,
    ) -> anyhow::Result<()> {
        let elfs = self.firmware_for(ctx.exp_id, globals, first)?;
        parts.nodes.flash(&elfs)?;

        let prefix = first
            .env_str("SITE_PREFIX")
            .ok_or_else(|| ConfigurationError::invalid("SITE_PREFIX is not set"))?;
        parts.br.start(parts.nodes.network(), &prefix)?;
        ctx.border_router = parts.br.pane().cloned();
        ctx.tap = parts.br.tap().map(str::to_owned);
        Ok(())
    }

    fn post_experiment(&self, parts: &mut Controllers) {
        parts.nodes.close_consoles();
        parts.sniffer.stop();
        parts.resolver.stop();
        parts.br.stop();
        self.session.shell.close_all();
    }

    fn resolver_host(&mut self) -> anyhow::Result<Ipv6Addr> {
        if let Some(addr) = self.bind_address {
            return Ok(addr);
        }
        let addr = bind_address(&self.session.shell)?;
        self.bind_address = Some(addr);
        Ok(addr)
    }

    fn execute_run(
        &mut self,
        parts: &mut Controllers,
        ctx: &mut Context,
        globals: &Globals,
        run: &Run,
    ) -> anyhow::Result<RunOutcome> {
        let name = NameContext {
            exp_name: globals.experiment_name().to_owned(),
            exp_id: ctx.exp_id,
            time: self.backend.clock.now(),
        };
        let stem = run_stem(run, &name)?;
        let dir = self.data_dir()?;
        let log = artifact_path(&dir, &stem, "log");
        ctx.log = Some(log.clone());
        ctx.pcap = Some(artifact_path(&dir, &stem, "pcap"));
        info!("starting run {}", stem);

        if run.rebuild {
            let elfs = prepare_firmware(
                self.backend.testbed.as_ref(),
                globals,
                &self.network,
                run,
                &self.base_dir,
            )?;
            parts.nodes.flash(&elfs)?;
        }

        let res = self.pre_run_and_run(parts, ctx, run);
        ctx.enter(RunState::Draining);
        let artifacts = self.post_run(parts, ctx, &dir, &stem);
        res?;

        if self.backend.clock.interrupted() {
            return Ok(RunOutcome::Interrupted);
        }
        Ok(RunOutcome::Done(artifacts))
    }

    fn pre_run_and_run(
        &mut self,
        parts: &mut Controllers,
        ctx: &mut Context,
        run: &Run,
    ) -> anyhow::Result<()> {
        /* pre_run */
        ctx.enter(RunState::PrePreparing);
        let host = self.resolver_host()?;
        let endpoint = parts.resolver.start(run, host)?;
        ctx.resolver = parts.resolver.pane().cloned();
        if let Some(pcap) = &ctx.pcap {
            parts.sniffer.start(ctx.exp_id, run.link_layer(), pcap)?;
        }
        parts.nodes.prepare(run, &endpoint, &mut parts.br)?;
        ctx.border_router = parts.br.pane().cloned();
        ctx.tap = parts.br.tap().map(str::to_owned);
        ctx.enter(RunState::NodesReady);
        debug!("{} ready", ctx.non_sink.join(", "));

        /* run */
        let Session { shell, tmux, clock, .. } = &self.session;
        let pane = tmux.get_or_create("run")?;
        ctx.run_pane = Some(pane.clone());
        let log = ctx.log.as_deref().unwrap_or_else(|| Path::new("run.log"));
        tmux.send_line(
            &pane,
            &format!(
                "{} | tee -a {}",
                shell.client_line(&format!("serial_aggregator -i {}", ctx.exp_id)),
                log.display()
            ),
        )?;
        clock.sleep(Duration::from_secs(2));
        tmux.send_line(&pane, &experiment_command(run))?;
        ctx.enter(RunState::Running);

        let wait = run.wait.unwrap_or_default();
        info!("waiting {} s for the run to finish", wait);
        clock.sleep(Duration::from_secs_f64(wait));
        Ok(())
    }

    /// Collects what the run left behind. Runs on every exit path of a run.
    fn post_run(&self, parts: &mut Controllers, ctx: &mut Context, dir: &Path, stem: &str) -> Vec<PathBuf> {
        let Session { tmux, clock, .. } = &self.session;
        let mut artifacts = vec![];

        if let Some(pane) = &ctx.run_pane {
            for cmd in ["ifconfig", "pktbuf", "ps"] {
                _ = tmux
                    .send_line(pane, cmd)
                    .inspect_err(|e| warn!("{} in {} failed: {}", cmd, pane.name(), e));
            }
            clock.sleep(Duration::from_secs(1));
        }
        if let Some(log) = ctx.log.take() {
            artifacts.push(log);
        }

        if parts.br.pane().is_some() {
            match parts.br.diagnostics(stem) {
                Ok(dump) => {
                    let path = artifact_path(dir, stem, "border-router.log");
                    match fs::write(&path, dump) {
                        Ok(()) => artifacts.push(path),
                        Err(e) => warn!("writing {} failed: {}", path.display(), e),
                    }
                }
                Err(e) => warn!("border router diagnostics failed: {:#}", e),
            }
        }

        if let Some(pcap) = parts.sniffer.pcap() {
            debug!("compressing {}", pcap.display());
        }
        if let Some(gz) = parts.sniffer.stop() {
            artifacts.push(gz);
        }
        ctx.pcap = None;
        if parts.resolver.is_running() {
            parts.resolver.stop();
        }
        ctx.resolver = None;

        if let Some(pane) = ctx.run_pane.take() {
            _ = tmux
                .interrupt(&pane)
                .inspect_err(|e| warn!("interrupting {} failed: {}", pane.name(), e));
        }
        artifacts
    }
}

/// Builds the firmware for `group` and submits its reservation.
fn reserve(
    testbed: &dyn Testbed,
    globals: &Globals,
    network: &Network,
    base_dir: &Path,
    group: &Group,
) -> anyhow::Result<(u64, BTreeMap<String, PathBuf>)> {
    let first = group
        .runs
        .first()
        .ok_or_else(|| ConfigurationError::invalid("unscheduled group without runs"))?
        .merged(globals);
    let elfs = prepare_firmware(testbed, globals, network, &first, base_dir)?;
    let reservation = Reservation {
        name: globals.experiment_name().to_owned(),
        duration_min: group
            .duration
            .or(globals.duration)
            .unwrap_or(DEFAULT_DURATION_MIN),
        site: network.site().to_owned(),
        nodes: network.nodes().map(str::to_owned).collect(),
        profile: globals.profiles.first().cloned(),
    };
    let exp_id = testbed.submit(&reservation)?;
    Ok((exp_id, elfs))
}
