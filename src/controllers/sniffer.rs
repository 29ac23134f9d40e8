use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    descs::LinkLayer,
    utils::{command::Cmd, tmux::Pane, Session},
};

/// Radio capture of the whole experiment, written by the testbed's
/// sniffer aggregator.
pub struct Sniffer {
    session: Session,
    capture: Option<(Pane, PathBuf)>,
}

impl Sniffer {
    pub fn new(session: Session) -> Self {
        Sniffer {
            session,
            capture: None,
        }
    }

    pub fn pcap(&self) -> Option<&Path> {
        self.capture.as_ref().map(|(_, p)| p.as_path())
    }

    /// Starts capturing into `pcap`. BLE has no sniffer profile, so nothing
    /// happens there.
    pub fn start(&mut self, exp_id: u64, link_layer: LinkLayer, pcap: &Path) -> anyhow::Result<()> {
        self.stop();
        if link_layer == LinkLayer::Ble {
            debug!("no sniffer on BLE");
            return Ok(());
        }
        let Session { shell, tmux, .. } = &self.session;
        info!("starting sniffer into {}", pcap.display());

        let pane = tmux.get_or_create("sniffer")?;
        self.capture = Some((pane.clone(), pcap.to_path_buf()));
        tmux.send_line(
            &pane,
            &format!(
                "{} > {}",
                shell.client_line(&format!("sniffer_aggregator -i {} -o -", exp_id)),
                pcap.display()
            ),
        )?;
        Ok(())
    }

    /// Stops the capture and compresses it. Returns the `.pcap.gz` when a
    /// capture was running.
    pub fn stop(&mut self) -> Option<PathBuf> {
        let (pane, pcap) = self.capture.take()?;
        let Session {
            runner,
            shell,
            tmux,
            clock,
        } = &self.session;
        info!("stopping sniffer");

        for _ in 0..3 {
            if let Err(e) = tmux.interrupt(&pane) {
                warn!("interrupting sniffer failed: {}", e);
            }
            clock.sleep(Duration::from_millis(500));
        }
        if let Err(e) = shell.run_once("pkill -f sniffer_aggregator") {
            debug!("pkill sniffer_aggregator: {}", e);
        }

        let res = runner.output(&Cmd::new("gzip").args(["-9", "-f"]).arg(pcap.to_string_lossy()));
        if let Err(e) = res {
            warn!("compressing {} failed: {}", pcap.display(), e);
            return None;
        }
        let mut gz = pcap.into_os_string();
        gz.push(".gz");
        Some(PathBuf::from(gz))
    }
}

impl Drop for Sniffer {
    fn drop(&mut self) {
        self.stop();
    }
}
