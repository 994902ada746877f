//! Job bookkeeping: mutual exclusion between captures and restores, and
//! per-job stage tracking.

use crate::utils::{BackupError, Result};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;

/// Claim key held by any capture of `database`.
pub fn capture_key(database: &str) -> String {
    format!("capture:{database}")
}

/// Claim key held by anything writing to or reading a consistent view of `target`.
pub fn target_key(target: &str) -> String {
    format!("target:{target}")
}

/// Tracks which exclusive keys are held by running jobs.
#[derive(Clone, Default)]
pub struct JobTracker {
    active: Arc<Mutex<HashMap<String, String>>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim every key or none. A key already held yields `Busy` naming the holder.
    pub fn claim(&self, job: &str, keys: Vec<String>) -> Result<JobGuard> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| BackupError::Busy("job tracker poisoned".into()))?;

        if let Some((key, holder)) = keys
            .iter()
            .find_map(|k| active.get(k).map(|holder| (k, holder)))
        {
            return Err(BackupError::Busy(format!("{key} is held by {holder}")));
        }
        for key in &keys {
            active.insert(key.clone(), job.to_string());
        }

        Ok(JobGuard {
            tracker: self.clone(),
            keys,
        })
    }

    /// Held keys and the job holding each, sorted by key.
    pub fn active(&self) -> Vec<(String, String)> {
        let mut held: Vec<(String, String)> = match self.active.lock() {
            Ok(active) => active.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Err(_) => Vec::new(),
        };
        held.sort();
        held
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.active
            .lock()
            .map(|active| active.contains_key(key))
            .unwrap_or(false)
    }

    fn release(&self, keys: &[String]) {
        if let Ok(mut active) = self.active.lock() {
            for key in keys {
                active.remove(key);
            }
        }
    }
}

/// Releases its keys when dropped.
pub struct JobGuard {
    tracker: JobTracker,
    keys: Vec<String>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.tracker.release(&self.keys);
    }
}

/// Pipeline stages of a backup job. Any stage may end in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Pending,
    Capturing,
    Compressing,
    Encrypting,
    Checksumming,
    PersistingMetadata,
    Uploading,
    Succeeded,
    Failed,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Capturing => "capturing",
            Self::Compressing => "compressing",
            Self::Encrypting => "encrypting",
            Self::Checksumming => "checksumming",
            Self::PersistingMetadata => "persisting_metadata",
            Self::Uploading => "uploading",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current stage and elapsed time of one job, logged on every transition.
#[derive(Debug)]
pub struct JobRun {
    id: String,
    started: Instant,
    stage: JobStage,
}

impl JobRun {
    pub fn start(id: impl Into<String>) -> Self {
        let run = Self {
            id: id.into(),
            started: Instant::now(),
            stage: JobStage::Pending,
        };
        info!(backup_id = %run.id, stage = %run.stage, "Job started");
        run
    }

    pub fn enter(&mut self, stage: JobStage) {
        self.stage = stage;
        info!(backup_id = %self.id, stage = %stage, elapsed_ms = self.elapsed_ms(), "Stage");
    }

    pub fn stage(&self) -> JobStage {
        self.stage
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Run one pipeline stage under its own time limit.
pub async fn with_timeout<T, F>(stage: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BackupError::Timeout {
            stage: stage.to_string(),
            secs: limit.as_secs(),
        }),
    }
}
