//! Error taxonomy for the backup engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Transform failed: {0}")]
    Transform(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("Restore failed: {0}")]
    Restore(String),

    #[error("Post-restore validation failed: {0}")]
    Validation(String),

    #[error("Backup not found: {0}")]
    NotFound(String),

    #[error("Backup {0} did not complete successfully and cannot be restored")]
    NotRestorable(String),

    #[error("No successful full backup before {0}")]
    NoBaseline(String),

    #[error("Segment {segment} is out of order: {detail}")]
    OutOfOrder { segment: String, detail: String },

    #[error("Operation refused, conflicting job in progress: {0}")]
    Busy(String),

    #[error("Stage {stage} timed out after {secs}s")]
    Timeout { stage: String, secs: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Remote storage error: {0}")]
    Remote(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackupError {
    /// True for errors that mean the stored artifact must not be trusted.
    pub fn is_integrity(&self) -> bool {
        matches!(self, BackupError::Integrity { .. })
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
