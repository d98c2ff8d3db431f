//! CheckpointManager — durable record of the last completed year.
//!
//! Layout: `<checkpoint_dir>/<run_id>/year-YYYY.json`, one file per
//! committed year. "Latest" is the file with the highest year.
//!
//! RULE: A checkpoint is written only after the year's events, state and
//! report are durably in the store (write-then-commit).
//! RULE: A checkpoint file is never partially visible: it is written to a
//! temp file, synced, then renamed into place.
//! RULE: A checkpoint whose config fingerprint differs from the current one
//! is never resumed from. Fail loudly; `--force` discards it.

use crate::{
    error::{SimError, SimResult},
    snapshot::WorkforceSnapshot,
    types::{Fingerprint, SimulationYear},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub run_id:              String,
    pub last_completed_year: SimulationYear,
    pub config_fingerprint:  Fingerprint,
    pub summary_metrics:     WorkforceSnapshot,
    pub timestamp:           DateTime<Utc>,
}

impl CheckpointRecord {
    /// Refuse a checkpoint written under a different configuration.
    pub fn verify(&self, config_fingerprint: &str) -> SimResult<()> {
        if self.config_fingerprint != config_fingerprint {
            return Err(SimError::StaleCheckpoint {
                run_id:                 self.run_id.clone(),
                checkpoint_fingerprint: self.config_fingerprint.clone(),
                config_fingerprint:     config_fingerprint.to_string(),
            });
        }
        Ok(())
    }
}

enum Backend {
    Directory(PathBuf),
    /// Used when no checkpoint directory is configured (tests, dry runs).
    Memory(Mutex<BTreeMap<String, BTreeMap<SimulationYear, CheckpointRecord>>>),
}

pub struct CheckpointManager {
    backend: Backend,
}

fn file_name(year: SimulationYear) -> String {
    format!("year-{year:04}.json")
}

fn year_of(path: &Path) -> Option<SimulationYear> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix("year-")?.strip_suffix(".json")?.parse().ok()
}

impl CheckpointManager {
    pub fn new(dir: Option<&Path>) -> SimResult<Self> {
        let backend = match dir {
            Some(d) => {
                std::fs::create_dir_all(d)?;
                Backend::Directory(d.to_path_buf())
            }
            None => Backend::Memory(Mutex::new(BTreeMap::new())),
        };
        Ok(Self { backend })
    }

    pub fn in_memory() -> Self {
        Self { backend: Backend::Memory(Mutex::new(BTreeMap::new())) }
    }

    fn run_dir(root: &Path, run_id: &str) -> PathBuf {
        root.join(run_id)
    }

    /// Record `year` as completed for `run_id`.
    pub fn commit(
        &self,
        run_id: &str,
        year: SimulationYear,
        config_fingerprint: &str,
        summary_metrics: WorkforceSnapshot,
    ) -> SimResult<CheckpointRecord> {
        let record = CheckpointRecord {
            run_id:              run_id.to_string(),
            last_completed_year: year,
            config_fingerprint:  config_fingerprint.to_string(),
            summary_metrics,
            timestamp:           Utc::now(),
        };
        match &self.backend {
            Backend::Directory(root) => {
                let dir = Self::run_dir(root, run_id);
                std::fs::create_dir_all(&dir)?;
                let path = dir.join(file_name(year));
                let tmp = path.with_extension("json.tmp");
                let json = serde_json::to_vec_pretty(&record)?;
                {
                    let mut file = std::fs::File::create(&tmp)?;
                    file.write_all(&json)?;
                    file.sync_all()?;
                }
                std::fs::rename(&tmp, &path)?;
                log::info!("checkpoint: run={run_id} year={year} committed ({})", path.display());
            }
            Backend::Memory(map) => {
                let mut map = map.lock().unwrap_or_else(|p| p.into_inner());
                map.entry(run_id.to_string()).or_default().insert(year, record.clone());
                log::info!("checkpoint: run={run_id} year={year} committed (memory)");
            }
        }
        Ok(record)
    }

    /// Every checkpoint of a run, oldest first.
    pub fn history(&self, run_id: &str) -> SimResult<Vec<CheckpointRecord>> {
        match &self.backend {
            Backend::Directory(root) => {
                let dir = Self::run_dir(root, run_id);
                if !dir.exists() {
                    return Ok(Vec::new());
                }
                let mut years: Vec<(SimulationYear, PathBuf)> = std::fs::read_dir(&dir)?
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter_map(|path| year_of(&path).map(|y| (y, path)))
                    .collect();
                years.sort_by_key(|(y, _)| *y);
                years
                    .into_iter()
                    .map(|(_, path)| {
                        let bytes = std::fs::read(&path)?;
                        Ok(serde_json::from_slice(&bytes)?)
                    })
                    .collect()
            }
            Backend::Memory(map) => {
                let map = map.lock().unwrap_or_else(|p| p.into_inner());
                Ok(map.get(run_id).map(|m| m.values().cloned().collect()).unwrap_or_default())
            }
        }
    }

    /// The checkpoint with the highest completed year, if any.
    pub fn latest(&self, run_id: &str) -> SimResult<Option<CheckpointRecord>> {
        Ok(self.history(run_id)?.pop())
    }

    /// Remove every checkpoint of a run. Returns how many were removed.
    pub fn clear(&self, run_id: &str) -> SimResult<usize> {
        let removed = match &self.backend {
            Backend::Directory(root) => {
                let dir = Self::run_dir(root, run_id);
                if !dir.exists() {
                    return Ok(0);
                }
                let n = std::fs::read_dir(&dir)?
                    .filter_map(|e| e.ok())
                    .filter(|e| year_of(&e.path()).is_some())
                    .count();
                std::fs::remove_dir_all(&dir)?;
                n
            }
            Backend::Memory(map) => {
                let mut map = map.lock().unwrap_or_else(|p| p.into_inner());
                map.remove(run_id).map(|m| m.len()).unwrap_or(0)
            }
        };
        log::warn!("checkpoint: cleared {removed} checkpoints for run={run_id}");
        Ok(removed)
    }
}
