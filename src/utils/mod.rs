use std::{
    path::{Path, PathBuf},
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

pub mod command;
#[cfg(test)]
pub mod mock;
pub mod results_uploader;
pub mod serial;
pub mod ssh;
pub mod tmux;

use command::CommandRunner;
use ssh::RemoteShell;
use tmux::Tmux;

/// Source of time for every explicit wait in the dispatcher.
pub trait Clock {
    fn sleep(&self, dur: Duration);

    /// Unix timestamp in seconds.
    fn now(&self) -> i64;

    /// Set once the operator asked us to wind down.
    fn interrupted(&self) -> bool {
        false
    }
}

/// Real time. Sleeps are cut short once the stop flag gets raised.
pub struct WallClock {
    stop: Arc<AtomicBool>,
}

impl WallClock {
    pub fn new(stop: Arc<AtomicBool>) -> Self {
        WallClock { stop }
    }
}

impl Clock for WallClock {
    fn sleep(&self, dur: Duration) {
        let deadline = Instant::now() + dur;
        while !self.stop.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(Duration::min(deadline - now, Duration::from_millis(200)));
        }
    }

    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn interrupted(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Retry {
    pub attempts: usize,
    pub interval: Duration,
}

impl Retry {
    pub const fn new(attempts: usize, interval: Duration) -> Self {
        Retry { attempts, interval }
    }
}

/// Calls `check` until it yields a value or the attempts run out. There is no
/// sleep after the last failed attempt. Errors from `check` abort the wait.
pub fn wait_for_predicate<T>(
    clock: &dyn Clock,
    retry: Retry,
    mut check: impl FnMut(usize) -> anyhow::Result<Option<T>>,
) -> anyhow::Result<Option<T>> {
    for attempt in 0..retry.attempts {
        if let Some(value) = check(attempt)? {
            return Ok(Some(value));
        }
        if attempt + 1 < retry.attempts {
            clock.sleep(retry.interval);
        }
    }
    Ok(None)
}

/// Handles shared by the controllers of one experiment.
#[derive(Clone)]
pub struct Session {
    pub runner: Rc<dyn CommandRunner>,
    pub shell: Rc<RemoteShell>,
    pub tmux: Rc<Tmux>,
    pub clock: Rc<dyn Clock>,
}

/// Artifact file next to the run log, e.g. `udp-1-2.pcap.gz`.
pub fn artifact_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    dir.join(format!("{}.{}", stem, ext))
}
