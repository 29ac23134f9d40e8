use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::bail;

use super::{Descriptions, Globals, Group, Run};
use crate::error::ConfigurationError;

/// Owner of the description file. Every mutation rewrites it as a whole.
pub struct DescriptionStore {
    path: PathBuf,
    descs: Descriptions,
    /// unscheduled groups beyond the load limit, written back untouched
    deferred: Vec<Group>,
}

/// Position in the runs of one scheduled group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCursor {
    exp_id: u64,
    index: usize,
}

impl RunCursor {
    pub fn exp_id(&self) -> u64 {
        self.exp_id
    }

    /// Leaves the current run in the group and moves on.
    pub fn skip(&mut self) {
        self.index += 1;
    }
}

impl DescriptionStore {
    pub fn load(path: &Path, limit_unscheduled: Option<usize>) -> Result<Self, ConfigurationError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
            path: path.to_owned(),
            source,
        })?;
        let mut descs = Descriptions::from_yaml(&text)?;
        descs.validate()?;

        let deferred = match limit_unscheduled {
            Some(n) if n < descs.unscheduled.len() => descs.unscheduled.split_off(n),
            _ => vec![],
        };
        info!(
            "loaded {}: {} unscheduled groups ({} held back), {} scheduled",
            path.display(),
            descs.unscheduled.len(),
            deferred.len(),
            descs.scheduled.len()
        );

        Ok(DescriptionStore {
            path: path.to_owned(),
            descs,
            deferred,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn globals(&self) -> &Globals {
        &self.descs.globals
    }

    pub fn descriptions(&self) -> &Descriptions {
        &self.descs
    }

    pub fn scheduled_ids(&self) -> Vec<u64> {
        self.descs.scheduled.keys().copied().collect()
    }

    pub fn group(&self, exp_id: u64) -> Option<&Group> {
        self.descs.scheduled.get(&exp_id)
    }

    pub fn next_unscheduled(&self) -> Option<&Group> {
        self.descs.unscheduled.first()
    }

    pub fn save(&self) -> Result<(), ConfigurationError> {
        let mut on_disk = self.descs.clone();
        on_disk.unscheduled.extend(self.deferred.iter().cloned());
        let text = on_disk.to_yaml()?;
        atomic_write(&self.path, text.as_bytes()).map_err(|source| ConfigurationError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Reserves the first unscheduled group through `reserve` and files it
    /// under the returned experiment id. Nothing moves when `reserve` fails.
    pub fn schedule_with<F>(&mut self, reserve: F) -> anyhow::Result<Option<u64>>
    where
        F: FnOnce(&Group) -> anyhow::Result<u64>,
    {
        let group = match self.descs.unscheduled.first() {
            Some(group) => group,
            None => return Ok(None),
        };
        let exp_id = reserve(group)?;
        if self.descs.scheduled.contains_key(&exp_id) {
            bail!("experiment {} is already scheduled", exp_id);
        }

        let group = self.descs.unscheduled.remove(0);
        self.descs.scheduled.insert(exp_id, group);
        self.save()?;
        info!("scheduled group under experiment {}", exp_id);
        Ok(Some(exp_id))
    }

    /// Files the first unscheduled group under an experiment that is already
    /// running. Returns false when there is nothing to assign.
    pub fn assign(&mut self, exp_id: u64) -> Result<bool, ConfigurationError> {
        if self.descs.scheduled.contains_key(&exp_id) {
            return Ok(true);
        }
        if self.descs.unscheduled.is_empty() {
            return Ok(false);
        }
        let group = self.descs.unscheduled.remove(0);
        self.descs.scheduled.insert(exp_id, group);
        self.save()?;
        Ok(true)
    }

    /// Puts the group back in front of the queue.
    pub fn reschedule(&mut self, exp_id: u64) -> Result<(), ConfigurationError> {
        if let Some(group) = self.descs.scheduled.remove(&exp_id) {
            info!(
                "rescheduling {} remaining runs of experiment {}",
                group.runs.len(),
                exp_id
            );
            self.descs.unscheduled.insert(0, group);
            self.save()?;
        }
        Ok(())
    }

    pub fn consume(&self, exp_id: u64) -> RunCursor {
        RunCursor { exp_id, index: 0 }
    }

    pub fn current(&self, cursor: &RunCursor) -> Option<&Run> {
        self.group(cursor.exp_id)?.runs.get(cursor.index)
    }

    /// Drops the finished run under the cursor.
    pub fn complete(&mut self, cursor: &RunCursor) -> Result<Run, ConfigurationError> {
        let group = self
            .descs
            .scheduled
            .get_mut(&cursor.exp_id)
            .filter(|g| cursor.index < g.runs.len())
            .ok_or_else(|| {
                ConfigurationError::invalid(format!(
                    "no run {} in experiment {}",
                    cursor.index, cursor.exp_id
                ))
            })?;
        let run = group.runs.remove(cursor.index);
        self.save()?;
        Ok(run)
    }

    /// Forgets an experiment whose runs all completed.
    pub fn finish(&mut self, exp_id: u64) -> Result<(), ConfigurationError> {
        if self.group(exp_id).map_or(false, |g| g.runs.is_empty()) {
            self.descs.scheduled.remove(&exp_id);
            self.save()?;
        }
        Ok(())
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("descs");
    let tmp = path.with_file_name(format!(".{}.tmp.{}", name, std::process::id()));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)
}
