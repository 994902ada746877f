//! Test doubles shared by the engine's unit tests.

use crate::config::{BackupConfig, Redacted};
use crate::datastore::{
    CaptureWindow, Datastore, SegmentEntry, SegmentManifest, ValidationCheck, ValidationReport,
};
use crate::metadata::{BackupMetadata, BackupType};
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const TEST_KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

/// Operations a [`FakeDatastore`] was asked to perform, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    DumpFull,
    Capture,
    Recreate(String),
    Drop(String),
    ApplyFull(String),
    Replay { target: String, segment: String },
    Validate(String),
}

/// Scripted in-memory datastore. Dumps and captures write small files so
/// the rest of the pipeline runs against real artifacts.
#[derive(Default)]
pub struct FakeDatastore {
    ops: Mutex<Vec<Op>>,
    changes: Mutex<Vec<(String, String)>>,
    capture_delay: Mutex<Option<Duration>>,
    fail_capture: AtomicBool,
    fail_validation: AtomicBool,
    fail_apply: AtomicBool,
    fail_replay_of: Mutex<Option<String>>,
}

impl FakeDatastore {
    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }

    /// Files the next capture will produce.
    pub fn queue_changes(&self, files: &[(&str, &str)]) {
        *self.changes.lock().unwrap() = files
            .iter()
            .map(|(name, body)| (name.to_string(), body.to_string()))
            .collect();
    }

    /// Make dumps and captures block for `delay` (still honouring cancellation).
    pub fn delay_capture(&self, delay: Duration) {
        *self.capture_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_capture(&self) {
        self.fail_capture.store(true, Ordering::SeqCst);
    }

    pub fn fail_validation(&self) {
        self.fail_validation.store(true, Ordering::SeqCst);
    }

    pub fn fail_apply(&self) {
        self.fail_apply.store(true, Ordering::SeqCst);
    }

    /// Make replaying the segment directory named `segment` fail.
    pub fn fail_replay_of(&self, segment: &str) {
        *self.fail_replay_of.lock().unwrap() = Some(segment.to_string());
    }

    fn record(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }

    async fn capture_step(&self, cancel: &CancellationToken) -> Result<()> {
        if self.fail_capture.load(Ordering::SeqCst) {
            return Err(BackupError::Capture("connection refused".into()));
        }
        let delay = *self.capture_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(BackupError::Cancelled),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Datastore for FakeDatastore {
    fn primary(&self) -> &str {
        "school"
    }

    async fn dump_full(&self, out: &Path, cancel: &CancellationToken) -> Result<()> {
        self.record(Op::DumpFull);
        tokio::fs::write(out, b"-- partial dump\n").await?;
        self.capture_step(cancel).await?;
        tokio::fs::write(out, "CREATE TABLE students (id int);\n".repeat(64)).await?;
        Ok(())
    }

    async fn capture_changes(
        &self,
        window: CaptureWindow,
        out_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<SegmentManifest> {
        self.record(Op::Capture);
        self.capture_step(cancel).await?;
        tokio::fs::create_dir_all(out_dir).await?;

        let changes = self.changes.lock().unwrap().clone();
        let mut entries = Vec::new();
        for (name, body) in changes {
            tokio::fs::write(out_dir.join(&name), &body).await?;
            entries.push(SegmentEntry {
                name,
                size: body.len() as u64,
                mtime: window.end.timestamp(),
            });
        }
        Ok(SegmentManifest::new(window.start, window.end, entries))
    }

    async fn recreate(&self, target: &str, _cancel: &CancellationToken) -> Result<()> {
        self.record(Op::Recreate(target.to_string()));
        Ok(())
    }

    async fn drop_target(&self, target: &str, _cancel: &CancellationToken) -> Result<()> {
        self.record(Op::Drop(target.to_string()));
        Ok(())
    }

    async fn apply_full(&self, artifact: &Path, target: &str, _cancel: &CancellationToken) -> Result<()> {
        self.record(Op::ApplyFull(target.to_string()));
        let body = tokio::fs::read_to_string(artifact).await?;
        if self.fail_apply.load(Ordering::SeqCst) || !body.starts_with("CREATE TABLE") {
            return Err(BackupError::Restore("syntax error at or near".into()));
        }
        Ok(())
    }

    async fn replay_segment(
        &self,
        segment_dir: &Path,
        target: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let segment = segment_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.record(Op::Replay {
            target: target.to_string(),
            segment: segment.clone(),
        });
        if self.fail_replay_of.lock().unwrap().as_deref() == Some(segment.as_str()) {
            return Err(BackupError::Restore(format!("replay of {segment} failed")));
        }
        Ok(())
    }

    async fn validate(&self, target: &str, _cancel: &CancellationToken) -> Result<ValidationReport> {
        self.record(Op::Validate(target.to_string()));
        let passed = !self.fail_validation.load(Ordering::SeqCst);
        Ok(ValidationReport {
            checks: vec![ValidationCheck {
                name: "students".into(),
                passed,
                detail: if passed { "3 rows".into() } else { "relation does not exist".into() },
            }],
        })
    }
}

/// Config rooted in `dir` with compression and encryption switched on.
pub fn test_config(dir: &TempDir) -> BackupConfig {
    let mut config = BackupConfig::default();
    config.datastore.database = "school".into();
    config.storage.backup_dir = dir.path().join("backups");
    config.storage.encryption_key = Some(Redacted(TEST_KEY_HEX.into()));
    config
}

/// A finalized, successful record pointing at `path`.
pub fn restorable(backup_type: BackupType, timestamp: DateTime<Utc>, path: &str) -> BackupMetadata {
    let mut record = BackupMetadata::pending(backup_type, timestamp, PathBuf::from(path));
    record.success = true;
    record.checksum = "0".repeat(64);
    record.size = 1;
    record
}
