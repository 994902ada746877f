//! The relational datastore being protected.
//!
//! [`Datastore`] is everything the engine needs from the database: a full
//! logical dump, change-log capture for a time window, and the target-side
//! operations used by restore. [`postgres::PostgresDatastore`] implements it
//! with the PostgreSQL client tools.

pub mod manifest;
pub mod postgres;

pub use manifest::{SegmentEntry, SegmentManifest, MANIFEST_FILE};
pub use postgres::PostgresDatastore;

use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Longest database name PostgreSQL accepts.
const MAX_TARGET_NAME: usize = 63;

/// Change-log interval `(start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Outcome of one post-restore probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationCheck {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub checks: Vec<ValidationCheck>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// `Validation` error naming every failed probe, if any failed.
    pub fn into_result(self) -> Result<Self> {
        let failed: Vec<String> = self
            .checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| format!("{}: {}", c.name, c.detail))
            .collect();
        if failed.is_empty() {
            Ok(self)
        } else {
            Err(BackupError::Validation(failed.join("; ")))
        }
    }
}

#[async_trait]
pub trait Datastore: Send + Sync {
    /// Name of the primary database.
    fn primary(&self) -> &str;

    /// Write a complete logical snapshot of the primary to `out`.
    async fn dump_full(&self, out: &Path, cancel: &CancellationToken) -> Result<()>;

    /// Copy every change-log file of `window` into `out_dir` and describe it.
    async fn capture_changes(
        &self,
        window: CaptureWindow,
        out_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<SegmentManifest>;

    /// Drop `target` if present and create it empty.
    async fn recreate(&self, target: &str, cancel: &CancellationToken) -> Result<()>;

    /// Drop `target`; absent targets are not an error.
    async fn drop_target(&self, target: &str, cancel: &CancellationToken) -> Result<()>;

    /// Apply a plain full dump to `target`.
    async fn apply_full(&self, artifact: &Path, target: &str, cancel: &CancellationToken)
        -> Result<()>;

    /// Apply the files of one captured segment to `target`, in manifest order.
    async fn replay_segment(
        &self,
        segment_dir: &Path,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Run the sanity probes against `target`.
    async fn validate(&self, target: &str, cancel: &CancellationToken) -> Result<ValidationReport>;
}

/// Reject names that could be read as tool options or exceed the server limit.
pub fn validate_target_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_TARGET_NAME
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(BackupError::Restore(format!("invalid target name {name:?}")))
    }
}

/// Double-quote an SQL identifier, doubling embedded quotes. Dotted names
/// are quoted per part so `schema.table` still resolves.
pub fn quote_identifier(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}
