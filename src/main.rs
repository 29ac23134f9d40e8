#[macro_use]
extern crate log;

use std::{
    path::PathBuf,
    rc::Rc,
    sync::{atomic::AtomicBool, Arc},
};

use clap::Parser;
use log::Level;
use rand::{rngs::StdRng, SeedableRng};
use signal_hook::{consts::SIGINT, flag};

use controllers::resolver::{ALTERNATE_PORTS, BASELINE_PORTS};
use driver::{Backend, Dispatcher, Settings};
use testbed::IotlabCli;
use utils::{
    command::Subprocess,
    results_uploader::{ResultHandler, ResultIgnorer, ResultsUploader},
    serial::SerialConsoles,
    WallClock,
};

mod controllers;
mod descs;
mod driver;
mod error;
mod network;
mod testbed;
mod utils;

/// Runs the DNS transport experiments of a description file on IoT-LAB
///
/// Groups of runs are reserved one after another. Finished runs are removed
/// from the description file, failed groups are put back in front of the
/// queue.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Reserve at most this many unscheduled groups
    #[clap(short, long)]
    limit_unscheduled: Option<usize>,

    /// Run the first unscheduled group in this already running experiment
    #[clap(short = 'i', long)]
    exp_id: Option<u64>,

    /// Log level, also handed to the resolver
    #[clap(short, long, default_value_t = Level::Info)]
    verbosity: Level,

    /// Use the alternate resolver ports so a second dispatcher can share the frontend
    #[clap(long)]
    alt_ports: bool,

    #[clap(long)]
    push_results_url: Option<String>,

    /// Virtualenv on the frontend that provides aiodns-proxy
    virtualenv: String,

    #[clap(default_value = "descs.yaml")]
    descs: PathBuf,
}

fn main() {
    let args = Args::parse();

    // init logging
    if let Err(e) = simple_logger::init_with_level(args.verbosity) {
        eprintln!("logger setup failed: {}", e);
    }

    if let Err(e) = run(args) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    // first SIGINT winds down, the second one exits
    let stop = Arc::new(AtomicBool::new(false));
    flag::register_conditional_shutdown(SIGINT, 1, Arc::clone(&stop))?;
    flag::register(SIGINT, Arc::clone(&stop))?;

    let runner = Rc::new(Subprocess);
    let results: Box<dyn ResultHandler> = match args.push_results_url {
        Some(url) => Box::new(ResultsUploader::new(runner.clone(), url)),
        None => Box::new(ResultIgnorer::new()),
    };
    let agent = match (std::env::var("SSH_AUTH_SOCK"), std::env::var("SSH_AGENT_PID")) {
        (Ok(sock), Ok(pid)) => Some((sock, pid)),
        _ => None,
    };

    let settings = Settings {
        virtualenv: args.virtualenv,
        descs: args.descs,
        limit_unscheduled: args.limit_unscheduled,
        exp_id: args.exp_id,
        verbosity: args.verbosity.as_str().to_owned(),
        ports: if args.alt_ports {
            ALTERNATE_PORTS
        } else {
            BASELINE_PORTS
        },
        data_path: std::env::var_os("DATA_PATH").map(PathBuf::from),
    };
    let backend = Backend {
        runner: runner.clone(),
        clock: Rc::new(WallClock::new(stop)),
        testbed: Rc::new(IotlabCli::new(runner)),
        consoles: Rc::new(SerialConsoles),
        results,
        user: None,
        agent,
        rng: StdRng::from_entropy(),
    };

    Dispatcher::new(settings, backend)?.run()
}
