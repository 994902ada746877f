//! Suppress-log-continue handling for cleanup paths.
//!
//! Deleting old artifacts or dropping scratch databases must not abort the
//! surrounding operation, but a swallowed failure still has to be visible.
//! [`BestEffort`] logs each failure at `warn`, records it, and lets the caller
//! carry on. Reports expose the recorded failures.

use serde::Serialize;
use std::fmt::Display;
use tracing::warn;

/// One failure that was logged and skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuppressedFailure {
    pub operation: String,
    pub target: String,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct BestEffort {
    failures: Vec<SuppressedFailure>,
}

impl BestEffort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value on success; on failure logs, records and returns `None`.
    pub fn run<T, E: Display>(
        &mut self,
        operation: &str,
        target: &str,
        result: std::result::Result<T, E>,
    ) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(operation, target, error = %e, "Suppressed failure, continuing");
                self.failures.push(SuppressedFailure {
                    operation: operation.to_string(),
                    target: target.to_string(),
                    error: e.to_string(),
                });
                None
            }
        }
    }

    pub fn failures(&self) -> &[SuppressedFailure] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<SuppressedFailure> {
        self.failures
    }
}
