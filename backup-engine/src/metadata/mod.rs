//! Backup metadata records and their storage.
//!
//! One [`BackupMetadata`] document exists per backup job. It is created when
//! the job starts, finalized when the job ends (successfully or not) and is
//! only ever removed by retention cleanup.

pub mod cache;
pub mod store;

pub use cache::{Clock, ManualClock, MetadataCache, SystemClock, TtlCache};
pub use store::MetadataStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Incremental,
    Differential,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::Differential => "differential",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub id: String,

    #[serde(rename = "type")]
    pub backup_type: BackupType,

    /// Job start (UTC). For incrementals, the end of the captured log window.
    pub timestamp: DateTime<Utc>,

    /// Bytes of the final stored artifact
    pub size: u64,

    /// Wall-clock milliseconds for the job
    pub duration: u64,

    /// Hash of the artifact in its final stored form
    pub checksum: String,

    pub path: PathBuf,

    pub encrypted: bool,

    pub compressed: bool,

    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackupMetadata {
    /// Id derived from the type and creation time, e.g. `full-20261017T020000123456Z`.
    pub fn derive_id(backup_type: BackupType, timestamp: DateTime<Utc>) -> String {
        format!(
            "{}-{}",
            backup_type,
            timestamp.format("%Y%m%dT%H%M%S%6fZ")
        )
    }

    /// Optimistic record for a job that just started.
    pub fn pending(backup_type: BackupType, timestamp: DateTime<Utc>, path: PathBuf) -> Self {
        Self {
            id: Self::derive_id(backup_type, timestamp),
            backup_type,
            timestamp,
            size: 0,
            duration: 0,
            checksum: String::new(),
            path,
            encrypted: false,
            compressed: false,
            success: false,
            error: None,
        }
    }

    /// Failure record: size 0, empty checksum, message captured.
    pub fn fail(mut self, error: impl Into<String>, duration_ms: u64) -> Self {
        self.size = 0;
        self.checksum = String::new();
        self.duration = duration_ms;
        self.success = false;
        self.error = Some(error.into());
        self
    }

    pub fn is_full(&self) -> bool {
        self.backup_type == BackupType::Full
    }

    /// Only finalized successful records may feed a restore.
    pub fn is_restorable(&self) -> bool {
        self.success && !self.checksum.is_empty()
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.timestamp
    }
}
