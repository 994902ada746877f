//! Age-based retention.
//!
//! Records older than the retention window are deleted together with their
//! artifacts. Full backups are exempt while `exempt_full` is set, so every
//! full backup stays available as a recovery baseline. Cleanup is not
//! transactional: a failing item is logged, reported and skipped. Artifacts
//! outside the backup directory are never deleted.

use crate::metadata::{BackupMetadata, MetadataStore};
use crate::utils::{BestEffort, Result, SuppressedFailure};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub retention_days: u32,
    pub exempt_full: bool,
}

impl RetentionPolicy {
    pub fn new(retention_days: u32) -> Self {
        Self {
            retention_days,
            exempt_full: true,
        }
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.retention_days))
    }

    pub fn is_expired(&self, record: &BackupMetadata, now: DateTime<Utc>) -> bool {
        if self.exempt_full && record.is_full() {
            return false;
        }
        record.timestamp < self.cutoff(now)
    }

    /// Records the policy would delete at `now`.
    pub fn select_expired<'a>(
        &self,
        records: &'a [BackupMetadata],
        now: DateTime<Utc>,
    ) -> Vec<&'a BackupMetadata> {
        records.iter().filter(|r| self.is_expired(r, now)).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub deleted_count: usize,
    /// Sum of the recorded sizes of deleted backups
    pub freed_space: u64,
    pub deleted_ids: Vec<String>,
    pub suppressed: Vec<SuppressedFailure>,
}

pub struct RetentionManager {
    policy: RetentionPolicy,
    store: Arc<MetadataStore>,
    backup_root: PathBuf,
}

impl RetentionManager {
    pub fn new(policy: RetentionPolicy, store: Arc<MetadataStore>, backup_root: impl Into<PathBuf>) -> Self {
        Self {
            policy,
            store,
            backup_root: backup_root.into(),
        }
    }

    /// Remove an artifact, refusing anything not strictly below the backup root.
    async fn remove_artifact(&self, path: &Path) -> std::result::Result<(), String> {
        let contained = path != self.backup_root
            && path.starts_with(&self.backup_root)
            && !path.components().any(|c| matches!(c, Component::ParentDir));
        if !contained {
            return Err(format!(
                "{} is outside backup directory {}",
                path.display(),
                self.backup_root.display()
            ));
        }
        crate::fs::remove_path(path).await.map_err(|e| e.to_string())
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Delete every expired backup. A record is only removed once its
    /// artifact is gone, so a failed artifact deletion is retried next pass.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let records = self.store.list().await?;
        let expired = self.policy.select_expired(&records, now);
        let mut best_effort = BestEffort::new();
        let mut report = CleanupReport::default();

        info!(
            candidates = expired.len(),
            cutoff = %self.policy.cutoff(now),
            "Running retention cleanup"
        );

        for record in expired {
            let artifact = self.remove_artifact(&record.path).await;
            if best_effort
                .run("delete_artifact", &record.id, artifact)
                .is_none()
            {
                continue;
            }
            if let Some(true) = best_effort.run("delete_metadata", &record.id, self.store.delete(&record.id).await) {
                report.deleted_count += 1;
                report.freed_space += record.size;
                report.deleted_ids.push(record.id.clone());
            }
        }

        report.suppressed = best_effort.into_failures();
        info!(
            deleted = report.deleted_count,
            freed_bytes = report.freed_space,
            suppressed = report.suppressed.len(),
            "Retention cleanup finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{BackupType, ManualClock, TtlCache};
    use tempfile::TempDir;

    fn record(backup_type: BackupType, ts: DateTime<Utc>, path: std::path::PathBuf, size: u64) -> BackupMetadata {
        let mut record = BackupMetadata::pending(backup_type, ts, path);
        record.size = size;
        record.checksum = "abc".into();
        record.success = true;
        record
    }

    fn store(dir: &TempDir) -> Arc<MetadataStore> {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = Arc::new(TtlCache::new(std::time::Duration::from_secs(60), 16, clock));
        Arc::new(MetadataStore::new(dir.path().join("logs"), cache))
    }

    #[test]
    fn test_full_backups_are_exempt() {
        let now = Utc::now();
        let policy = RetentionPolicy::new(30);
        let records = vec![
            record(BackupType::Full, now - Duration::days(400), "a".into(), 1),
            record(BackupType::Incremental, now - Duration::days(45), "b".into(), 1),
            record(BackupType::Incremental, now - Duration::days(10), "c".into(), 1),
        ];

        let expired = policy.select_expired(&records, now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].path, std::path::PathBuf::from("b"));

        let strict = RetentionPolicy { exempt_full: false, ..policy };
        assert_eq!(strict.select_expired(&records, now).len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_frees_recorded_size_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let now = Utc::now();

        let full_path = dir.path().join("full.sql.zst");
        std::fs::write(&full_path, b"full").unwrap();
        let run_dir = dir.path().join("incremental-old");
        std::fs::create_dir(&run_dir).unwrap();
        std::fs::write(run_dir.join("0001.sql"), b"change").unwrap();

        let full = record(BackupType::Full, now - Duration::days(400), full_path.clone(), 4);
        let incremental = record(BackupType::Incremental, now - Duration::days(45), run_dir.clone(), 6);
        store.save(&full).await.unwrap();
        store.save(&incremental).await.unwrap();

        let manager = RetentionManager::new(RetentionPolicy::new(30), store.clone(), dir.path());
        let report = manager.cleanup(now).await.unwrap();
        assert_eq!(report.deleted_count, 1);
        assert_eq!(report.freed_space, 6);
        assert_eq!(report.deleted_ids, vec![incremental.id.clone()]);
        assert!(!run_dir.exists());
        assert!(full_path.exists());
        assert!(store.get(&full.id).await.unwrap().is_some());

        let again = manager.cleanup(now).await.unwrap();
        assert_eq!(again.deleted_count, 0);
        assert_eq!(again.freed_space, 0);
    }

    #[tokio::test]
    async fn test_missing_artifact_still_removes_record() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let now = Utc::now();
        let gone = record(BackupType::Incremental, now - Duration::days(60), dir.path().join("gone"), 3);
        store.save(&gone).await.unwrap();

        let report = RetentionManager::new(RetentionPolicy::new(30), store.clone(), dir.path())
            .cleanup(now)
            .await
            .unwrap();
        assert_eq!(report.deleted_count, 1);
        assert!(report.suppressed.is_empty());
        assert!(store.get(&gone.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_artifacts_outside_backup_dir_are_refused() {
        let dir = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        let store = store(&dir);
        let now = Utc::now();

        let foreign = elsewhere.path().join("keep-me");
        std::fs::create_dir(&foreign).unwrap();
        std::fs::write(foreign.join("data"), b"precious").unwrap();
        let escaping = dir.path().join("..").join("escape");

        let outside = record(BackupType::Incremental, now - Duration::days(60), foreign.clone(), 8);
        let dotted = record(BackupType::Incremental, now - Duration::days(61), escaping, 2);
        store.save(&outside).await.unwrap();
        store.save(&dotted).await.unwrap();

        let report = RetentionManager::new(RetentionPolicy::new(30), store.clone(), dir.path())
            .cleanup(now)
            .await
            .unwrap();

        assert_eq!(report.deleted_count, 0);
        assert_eq!(report.suppressed.len(), 2);
        assert!(report
            .suppressed
            .iter()
            .all(|f| f.operation == "delete_artifact" && f.error.contains("outside backup directory")));
        assert!(foreign.join("data").exists());
        assert!(store.get(&outside.id).await.unwrap().is_some());
        assert!(store.get(&dotted.id).await.unwrap().is_some());
    }
}
