//! Utility modules for the backup engine.

pub mod best_effort;
pub mod errors;
pub mod logger;

pub use best_effort::{BestEffort, SuppressedFailure};
pub use errors::{BackupError, Result};
