use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    rc::Rc,
};

use anyhow::Context;
use serde::Deserialize;

use crate::{
    network::{archi, number},
    utils::command::{Cmd, CommandRunner},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Power {
    Stop,
    Start,
}

impl Power {
    fn flag(self) -> &'static str {
        match self {
            Power::Stop => "--stop",
            Power::Start => "--start",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub name: String,
    pub duration_min: u64,
    pub site: String,
    pub nodes: Vec<String>,
    pub profile: Option<String>,
}

/// One RIOT application build.
#[derive(Debug, Clone, PartialEq)]
pub struct FirmwareBuild {
    pub app: PathBuf,
    pub board: String,
    pub env: BTreeMap<String, String>,
    pub flashfile: Option<PathBuf>,
}

impl FirmwareBuild {
    /// Image produced by the build, honouring `BINDIRBASE`.
    pub fn elf(&self) -> PathBuf {
        if let Some(path) = &self.flashfile {
            return path.clone();
        }
        let bindirbase = self
            .env
            .get("BINDIRBASE")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.app.join("bin"));
        let application = self
            .app
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "application".to_owned());
        bindirbase
            .join(&self.board)
            .join(format!("{}.elf", application))
    }
}

/// RIOT board of an IoT-LAB architecture.
pub fn default_board(archi: &str) -> &str {
    match archi {
        "m3" => "iotlab-m3",
        other => other,
    }
}

/// Reservation and node control on the testbed.
pub trait Testbed {
    fn build(&self, firmware: &FirmwareBuild) -> anyhow::Result<()>;
    fn submit(&self, reservation: &Reservation) -> anyhow::Result<u64>;
    fn wait_running(&self, exp_id: u64) -> anyhow::Result<()>;
    fn stop(&self, exp_id: u64) -> anyhow::Result<()>;
    fn flash(&self, exp_id: u64, site: &str, node: &str, elf: &Path) -> anyhow::Result<()>;
    fn power(&self, exp_id: u64, site: &str, node: &str, action: Power) -> anyhow::Result<()>;
}

/// `site,archi,1+2+3` lists, one per architecture.
pub fn node_lists(site: &str, nodes: &[String], profile: Option<&str>) -> Vec<String> {
    let mut by_archi: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for n in nodes {
        by_archi.entry(archi(n)).or_default().push(number(n));
    }
    by_archi
        .into_iter()
        .map(|(a, nums)| {
            let mut list = format!("{},{},{}", site, a, nums.join("+"));
            if let Some(p) = profile {
                list.push(',');
                list.push_str(p);
            }
            list
        })
        .collect()
}

#[derive(Deserialize)]
struct Submitted {
    id: u64,
}

/// Drives the `iotlab-*` command line tools and RIOT's make.
pub struct IotlabCli {
    runner: Rc<dyn CommandRunner>,
}

impl IotlabCli {
    pub fn new(runner: Rc<dyn CommandRunner>) -> Self {
        IotlabCli { runner }
    }

    fn node_cmd(&self, exp_id: u64, site: &str, node: &str) -> Cmd {
        Cmd::new("iotlab-node")
            .args(["-i", exp_id.to_string().as_str()])
            .arg("-l")
            .arg(format!("{},{},{}", site, archi(node), number(node)))
    }
}

impl Testbed for IotlabCli {
    fn build(&self, firmware: &FirmwareBuild) -> anyhow::Result<()> {
        info!("building {} for {}", firmware.app.display(), firmware.board);
        let mut cmd = Cmd::new("make")
            .arg("all")
            .cwd(&firmware.app)
            .env("BOARD", &firmware.board);
        for (k, v) in &firmware.env {
            cmd = cmd.env(k, v);
        }
        self.runner
            .output(&cmd)
            .with_context(|| format!("building {}", firmware.app.display()))?;
        Ok(())
    }

    fn submit(&self, reservation: &Reservation) -> anyhow::Result<u64> {
        let mut cmd = Cmd::new("iotlab-experiment").args([
            "submit",
            "-n",
            reservation.name.as_str(),
            "-d",
            reservation.duration_min.to_string().as_str(),
        ]);
        for list in node_lists(
            &reservation.site,
            &reservation.nodes,
            reservation.profile.as_deref(),
        ) {
            cmd = cmd.arg("-l").arg(list);
        }
        let out = self.runner.output(&cmd)?;
        let submitted: Submitted =
            serde_json::from_str(&out).context("parsing iotlab-experiment submit output")?;
        info!("submitted experiment {}", submitted.id);
        Ok(submitted.id)
    }

    fn wait_running(&self, exp_id: u64) -> anyhow::Result<()> {
        info!("waiting for experiment {} to run", exp_id);
        self.runner.output(
            &Cmd::new("iotlab-experiment").args(["wait", "-i", exp_id.to_string().as_str()]),
        )?;
        Ok(())
    }

    fn stop(&self, exp_id: u64) -> anyhow::Result<()> {
        info!("stopping experiment {}", exp_id);
        self.runner.output(
            &Cmd::new("iotlab-experiment").args(["stop", "-i", exp_id.to_string().as_str()]),
        )?;
        Ok(())
    }

    fn flash(&self, exp_id: u64, site: &str, node: &str, elf: &Path) -> anyhow::Result<()> {
        debug!("flashing {} with {}", node, elf.display());
        self.runner.output(
            &self
                .node_cmd(exp_id, site, node)
                .arg("--flash")
                .arg(elf.to_string_lossy()),
        )?;
        Ok(())
    }

    fn power(&self, exp_id: u64, site: &str, node: &str, action: Power) -> anyhow::Result<()> {
        self.runner
            .output(&self.node_cmd(exp_id, site, node).arg(action.flag()))?;
        Ok(())
    }
}
