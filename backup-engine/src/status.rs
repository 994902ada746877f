//! Aggregate health of the backup set.

use crate::config::HealthConfig;
use crate::metadata::BackupMetadata;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    pub total_backups: usize,
    /// Bytes held by successful backups
    pub total_size: u64,
    pub last_backup: Option<BackupMetadata>,
    pub last_successful_backup: Option<BackupMetadata>,
    pub recent_failures: usize,
    pub health_status: HealthStatus,
    pub issues: Vec<String>,
}

impl BackupStatus {
    /// Status reported when the records themselves cannot be read.
    pub fn unavailable(error: impl fmt::Display) -> Self {
        Self {
            total_backups: 0,
            total_size: 0,
            last_backup: None,
            last_successful_backup: None,
            recent_failures: 0,
            health_status: HealthStatus::Critical,
            issues: vec![format!("Unable to read backup status: {error}")],
        }
    }
}

/// Classify `records` at `now`. The worst tier raised by staleness or the
/// failure count wins.
pub fn evaluate(records: &[BackupMetadata], now: DateTime<Utc>, health: &HealthConfig) -> BackupStatus {
    let mut tier = HealthStatus::Healthy;
    let mut issues = Vec::new();

    let last_backup = records.iter().max_by_key(|r| r.timestamp).cloned();
    let last_successful_backup = records
        .iter()
        .filter(|r| r.success)
        .max_by_key(|r| r.timestamp)
        .cloned();

    match &last_successful_backup {
        None => {
            tier = HealthStatus::Critical;
            issues.push("No successful backup found".to_string());
        }
        Some(last) => {
            let age = now - last.timestamp;
            let hours = age.num_hours();
            if age > Duration::hours(health.critical_after_hours) {
                tier = tier.max(HealthStatus::Critical);
                issues.push(format!("Last successful backup was {hours} hours ago"));
            } else if age > Duration::hours(health.warning_after_hours) {
                tier = tier.max(HealthStatus::Warning);
                issues.push(format!("Last successful backup was {hours} hours ago"));
            }
        }
    }

    let window_start = now - Duration::days(health.failure_window_days);
    let recent_failures = records
        .iter()
        .filter(|r| !r.success && r.timestamp >= window_start)
        .count();
    if recent_failures > 0 {
        let severity = if recent_failures >= health.failure_critical_count {
            Some(HealthStatus::Critical)
        } else if recent_failures >= health.failure_warning_count {
            Some(HealthStatus::Warning)
        } else {
            None
        };
        if let Some(severity) = severity {
            tier = tier.max(severity);
            issues.push(format!(
                "{recent_failures} failed backup(s) in the last {} days",
                health.failure_window_days
            ));
        }
    }

    BackupStatus {
        total_backups: records.len(),
        total_size: records.iter().filter(|r| r.success).map(|r| r.size).sum(),
        last_backup,
        last_successful_backup,
        recent_failures,
        health_status: tier,
        issues,
    }
}
