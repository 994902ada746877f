//! Backup Engine Library
//!
//! Full and incremental backups of a PostgreSQL database with compression,
//! encryption, checksum verification, restore, point-in-time recovery and
//! age-based retention.

pub mod archive;
pub mod config;
pub mod datastore;
pub mod fs;
pub mod integrity;
pub mod jobs;
pub mod metadata;
pub mod orchestrator;
pub mod process;
pub mod remote;
pub mod restore;
pub mod retention;
pub mod shutdown;
pub mod status;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::BackupConfig;
pub use metadata::{BackupMetadata, BackupType};
pub use orchestrator::BackupOrchestrator;
pub use status::{BackupStatus, HealthStatus};
pub use utils::errors::{BackupError, Result};
