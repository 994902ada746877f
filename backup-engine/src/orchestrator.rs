//! Top-level backup API.
//!
//! The orchestrator owns one instance of every component and drives the
//! pipelines: capture, optional compression and encryption, checksum,
//! metadata, optional upload. A job that fails at any stage still leaves a
//! `success = false` record behind before the error is returned.

use crate::archive::ArchiveEncoder;
use crate::config::BackupConfig;
use crate::datastore::{CaptureWindow, Datastore, PostgresDatastore};
use crate::integrity::IntegrityVerifier;
use crate::jobs::{capture_key, target_key, with_timeout, JobGuard, JobRun, JobStage, JobTracker};
use crate::metadata::{
    BackupMetadata, BackupType, Clock, MetadataCache, MetadataStore, SystemClock, TtlCache,
};
use crate::process::TokioCommandRunner;
use crate::remote::{self, RemoteStorage};
use crate::restore::{plan_point_in_time, RestoreEngine, RestoreReport};
use crate::retention::{CleanupReport, RetentionManager, RetentionPolicy};
use crate::status::{self, BackupStatus};
use crate::utils::{BackupError, BestEffort, Result};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const FULL_DUMP_EXTENSION: &str = "sql";
const INTEGRITY_TARGET_PREFIX: &str = "integrity_test_";

pub struct BackupOrchestrator {
    config: Arc<BackupConfig>,
    datastore: Arc<dyn Datastore>,
    store: Arc<MetadataStore>,
    encoder: Arc<ArchiveEncoder>,
    verifier: IntegrityVerifier,
    restore: RestoreEngine,
    retention: RetentionManager,
    remote: Option<Arc<dyn RemoteStorage>>,
    clock: Arc<dyn Clock>,
    jobs: JobTracker,
    cancel: CancellationToken,
}

impl BackupOrchestrator {
    /// Production wiring: PostgreSQL client tools, system clock, TTL cache.
    pub async fn from_config(config: BackupConfig) -> Result<Self> {
        config.validate()?;
        let datastore = Arc::new(PostgresDatastore::new(
            config.datastore.clone(),
            config.timeouts.clone(),
            Arc::new(TokioCommandRunner),
        ));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cache = Arc::new(TtlCache::new(
            std::time::Duration::from_secs(config.cache.ttl_secs),
            config.cache.max_entries,
            clock.clone(),
        ));
        let remote = remote::from_config(&config).await?;
        Self::new(config, datastore, cache, clock, remote)
    }

    /// Wire the orchestrator from explicit collaborators.
    pub fn new(
        config: BackupConfig,
        datastore: Arc<dyn Datastore>,
        cache: Arc<dyn MetadataCache>,
        clock: Arc<dyn Clock>,
        remote: Option<Arc<dyn RemoteStorage>>,
    ) -> Result<Self> {
        config.ensure_layout()?;
        let encoder = Arc::new(ArchiveEncoder::from_config(&config)?);
        let store = Arc::new(MetadataStore::new(config.logs_dir(), cache));
        let restore = RestoreEngine::new(
            datastore.clone(),
            encoder.clone(),
            config.temp_dir(),
            config.timeouts.clone(),
        );
        let retention = RetentionManager::new(
            RetentionPolicy::new(config.storage.retention_days),
            store.clone(),
            config.storage.backup_dir.clone(),
        );

        Ok(Self {
            config: Arc::new(config),
            datastore,
            store,
            encoder,
            verifier: IntegrityVerifier::new(),
            restore,
            retention,
            remote,
            clock,
            jobs: JobTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn jobs(&self) -> &JobTracker {
        &self.jobs
    }

    /// Token cancelled by [`shutdown`](Self::shutdown); every external command watches it.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Kill in-flight external commands. Running jobs finalize as failed.
    pub fn shutdown(&self) {
        info!("Cancelling in-flight backup jobs");
        self.cancel.cancel();
    }

    /// Dump the primary, compress and encrypt as configured, checksum and record it.
    pub async fn create_full_backup(&self) -> Result<BackupMetadata> {
        let timestamp = self.unique_timestamp(BackupType::Full).await?;
        let id = BackupMetadata::derive_id(BackupType::Full, timestamp);
        let _guard = self.claim_capture(&id)?;

        let staging = self
            .config
            .full_dir()
            .join(format!("{}.{}", id, FULL_DUMP_EXTENSION));
        let record = BackupMetadata::pending(BackupType::Full, timestamp, staging);
        let mut run = JobRun::start(&record.id);

        let mut artifact = record.path.clone();
        let outcome = self.run_full(record.clone(), &mut artifact, &mut run).await;
        self.finalize(record, outcome, &artifact, &mut run).await
    }

    /// Capture the change log since the previous capture into its own run directory.
    pub async fn create_incremental_backup(&self) -> Result<BackupMetadata> {
        let timestamp = self.unique_timestamp(BackupType::Incremental).await?;
        let id = BackupMetadata::derive_id(BackupType::Incremental, timestamp);
        let _guard = self.claim_capture(&id)?;

        let run_dir = self.config.incremental_dir().join(&id);
        let record = BackupMetadata::pending(BackupType::Incremental, timestamp, run_dir.clone());
        let mut run = JobRun::start(&record.id);

        let outcome = self.run_incremental(record.clone(), &mut run).await;
        self.finalize(record, outcome, &run_dir, &mut run).await
    }

    /// Restore a full backup. With a target, the target is dropped and
    /// recreated first; without one the primary is restored in place.
    pub async fn restore_from_backup(&self, id: &str, target: Option<&str>) -> Result<RestoreReport> {
        let record = self.store.require(id).await?;
        if !record.success {
            return Err(BackupError::NotRestorable(record.id));
        }
        let target_name = target.unwrap_or_else(|| self.datastore.primary()).to_string();
        let _guard = self
            .jobs
            .claim(&format!("restore:{id}"), vec![target_key(&target_name)])?;

        let run = JobRun::start(format!("restore:{id}"));
        let result = self
            .restore
            .restore(&record, &target_name, target.is_some(), &self.cancel)
            .await;
        log_outcome(&run, &result);
        result
    }

    /// Restore the newest full backup before `target_time`, then replay the
    /// incrementals up to `target_time` in capture order.
    pub async fn point_in_time_restore(
        &self,
        target_time: DateTime<Utc>,
        target: Option<&str>,
    ) -> Result<RestoreReport> {
        let records = self.store.list().await?;
        let plan = plan_point_in_time(&records, target_time)?;
        let target_name = target.unwrap_or_else(|| self.datastore.primary()).to_string();
        let _guard = self.jobs.claim(
            &format!("pitr:{}", target_time.to_rfc3339()),
            vec![target_key(&target_name)],
        )?;

        info!(
            baseline = %plan.baseline.id,
            segments = plan.segments.len(),
            target = %target_name,
            "Starting point-in-time restore"
        );
        let run = JobRun::start(format!("pitr:{}", plan.baseline.id));
        let result = self
            .restore
            .point_in_time(&plan, &target_name, target.is_some(), &self.cancel)
            .await;
        log_outcome(&run, &result);
        result
    }

    /// Delete backups outside the retention window.
    pub async fn cleanup_old_backups(&self) -> Result<CleanupReport> {
        self.retention.cleanup(self.clock.now()).await
    }

    /// True when the artifact exists and matches its checksum and, for full
    /// backups, restores into a scratch database that passes validation.
    /// The scratch database is always dropped.
    pub async fn test_backup_integrity(&self, id: &str) -> Result<bool> {
        let record = self.store.require(id).await?;
        if !record.is_restorable() {
            warn!(backup_id = %id, "Backup did not complete successfully");
            return Ok(false);
        }
        if !tokio::fs::try_exists(&record.path).await.unwrap_or(false) {
            warn!(backup_id = %id, path = %record.path.display(), "Backup artifact is missing");
            return Ok(false);
        }
        match self.verifier.verify(&record.path, &record.checksum).await {
            Ok(()) => {}
            Err(BackupError::Cancelled) => return Err(BackupError::Cancelled),
            Err(e) => {
                warn!(backup_id = %id, error = %e, "Checksum verification failed");
                return Ok(false);
            }
        }
        if !record.is_full() {
            return Ok(true);
        }

        let target = format!("{}{}", INTEGRITY_TARGET_PREFIX, uuid::Uuid::new_v4().simple());
        let _guard = self
            .jobs
            .claim(&format!("verify:{id}"), vec![target_key(&target)])?;
        let restored = self.restore.restore(&record, &target, true, &self.cancel).await;

        let mut best_effort = BestEffort::new();
        // The scratch database goes away even when the job is being cancelled.
        let drop_token = CancellationToken::new();
        let dropped = with_timeout(
            "restore",
            self.config.timeouts.restore(),
            self.datastore.drop_target(&target, &drop_token),
        )
        .await;
        best_effort.run("drop_integrity_target", &target, dropped);

        match restored {
            Ok(_) => {
                info!(backup_id = %id, "Integrity test passed");
                Ok(true)
            }
            Err(BackupError::Cancelled) => Err(BackupError::Cancelled),
            Err(e) => {
                warn!(backup_id = %id, error = %e, "Integrity test restore failed");
                Ok(false)
            }
        }
    }

    /// Aggregate health. Never fails; unreadable records degrade to critical.
    pub async fn get_backup_status(&self) -> BackupStatus {
        match self.store.list().await {
            Ok(records) => status::evaluate(&records, self.clock.now(), &self.config.health),
            Err(e) => {
                error!(error = %e, "Failed to compute backup status");
                BackupStatus::unavailable(e)
            }
        }
    }

    /// Every record, newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupMetadata>> {
        self.store.list().await
    }

    pub async fn get_backup(&self, id: &str) -> Result<Option<BackupMetadata>> {
        self.store.get(id).await
    }

    /// Newest successful full backup.
    pub async fn latest_full_backup(&self) -> Result<Option<BackupMetadata>> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .find(|r| r.is_full() && r.is_restorable()))
    }

    fn claim_capture(&self, job: &str) -> Result<JobGuard> {
        let database = self.datastore.primary();
        self.jobs
            .claim(job, vec![capture_key(database), target_key(database)])
    }

    /// Now, truncated to the id's precision and nudged past any existing id.
    async fn unique_timestamp(&self, backup_type: BackupType) -> Result<DateTime<Utc>> {
        let mut timestamp = self.clock.now().trunc_subsecs(6);
        while self
            .store
            .exists(&BackupMetadata::derive_id(backup_type, timestamp))
            .await?
        {
            timestamp += Duration::microseconds(1);
        }
        Ok(timestamp)
    }

    async fn run_full(
        &self,
        mut record: BackupMetadata,
        artifact: &mut PathBuf,
        run: &mut JobRun,
    ) -> Result<BackupMetadata> {
        let timeouts = &self.config.timeouts;

        run.enter(JobStage::Capturing);
        with_timeout(
            "capture",
            timeouts.capture(),
            self.datastore.dump_full(artifact.as_path(), &self.cancel),
        )
        .await?;

        if self.encoder.compression_enabled() {
            self.ensure_active()?;
            run.enter(JobStage::Compressing);
            *artifact = with_timeout(
                "compress",
                timeouts.compress(),
                self.encoder.compress(artifact.as_path()),
            )
            .await?;
            record.compressed = true;
        }

        if self.encoder.encryption_enabled() {
            self.ensure_active()?;
            run.enter(JobStage::Encrypting);
            *artifact = with_timeout(
                "encrypt",
                timeouts.encrypt(),
                self.encoder.encrypt(artifact.as_path()),
            )
            .await?;
            record.encrypted = true;
        }

        self.ensure_active()?;
        run.enter(JobStage::Checksumming);
        record.checksum = self.verifier.checksum(artifact.as_path()).await?;
        record.size = crate::fs::path_size(artifact.as_path()).await?;
        record.path = artifact.clone();
        Ok(record)
    }

    async fn run_incremental(&self, mut record: BackupMetadata, run: &mut JobRun) -> Result<BackupMetadata> {
        let window = CaptureWindow {
            start: self.last_capture_point().await?,
            end: record.timestamp,
        };

        run.enter(JobStage::Capturing);
        let manifest = with_timeout(
            "capture",
            self.config.timeouts.capture(),
            self.datastore.capture_changes(window, &record.path, &self.cancel),
        )
        .await?;
        manifest.write(&record.path).await?;

        run.enter(JobStage::Checksumming);
        record.checksum = self.verifier.checksum_tree(&record.path).await?;
        record.size = crate::fs::path_size(&record.path).await?;
        Ok(record)
    }

    /// Timestamp of the newest successful capture, or the epoch.
    async fn last_capture_point(&self) -> Result<DateTime<Utc>> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|r| r.success && matches!(r.backup_type, BackupType::Full | BackupType::Incremental))
            .map(|r| r.timestamp)
            .max()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH))
    }

    /// Persist the outcome. On failure the partial artifact is removed and a
    /// failure record is written before the error is returned.
    async fn finalize(
        &self,
        pending: BackupMetadata,
        outcome: Result<BackupMetadata>,
        artifact: &Path,
        run: &mut JobRun,
    ) -> Result<BackupMetadata> {
        let mut record = match outcome {
            Ok(mut record) => {
                record.success = true;
                record.duration = run.elapsed_ms();
                record
            }
            Err(e) => {
                error!(
                    backup_id = %pending.id,
                    stage = %run.stage(),
                    elapsed_ms = run.elapsed_ms(),
                    error = %e,
                    "Backup failed"
                );
                let mut leftovers = vec![artifact.to_path_buf()];
                if pending.is_full() {
                    leftovers.extend(self.full_outputs(&pending.id).await);
                }
                let mut best_effort = BestEffort::new();
                for path in leftovers {
                    best_effort.run(
                        "remove_partial_artifact",
                        &path.display().to_string(),
                        crate::fs::remove_path(&path).await,
                    );
                }
                let failed = pending.fail(e.to_string(), run.elapsed_ms());
                run.enter(JobStage::PersistingMetadata);
                if let Err(save_error) = self.store.save(&failed).await {
                    error!(backup_id = %failed.id, error = %save_error, "Failed to record backup failure");
                }
                run.enter(JobStage::Failed);
                return Err(e);
            }
        };

        run.enter(JobStage::PersistingMetadata);
        self.store.save(&record).await?;

        if let Some(remote) = &self.remote {
            run.enter(JobStage::Uploading);
            if let Err(e) = self.upload(remote.as_ref(), &record).await {
                // The local artifact is intact, so the record stays restorable.
                error!(backup_id = %record.id, error = %e, "Upload failed");
                record.error = Some(format!("upload failed: {e}"));
                if let Err(save_error) = self.store.save(&record).await {
                    error!(backup_id = %record.id, error = %save_error, "Failed to record upload failure");
                }
                run.enter(JobStage::Failed);
                return Err(e);
            }
        }

        run.enter(JobStage::Succeeded);
        info!(
            backup_id = %record.id,
            size = record.size,
            duration_ms = record.duration,
            compressed = record.compressed,
            encrypted = record.encrypted,
            "Backup completed"
        );
        Ok(record)
    }

    async fn upload(&self, remote: &dyn RemoteStorage, record: &BackupMetadata) -> Result<String> {
        let name = record
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| record.id.clone());
        let key = format!("{}/{}", subdirectory(record.backup_type), name);
        with_timeout(
            "upload",
            self.config.timeouts.upload(),
            remote.upload(&record.path, &key, &self.cancel),
        )
        .await
    }

    /// In-process stages have no child to kill; they are checked between stages instead.
    fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        Ok(())
    }

    /// Everything under `full/` that belongs to job `id`, intermediates included.
    async fn full_outputs(&self, id: &str) -> Vec<PathBuf> {
        let prefix = format!("{id}.");
        let mut outputs = Vec::new();
        if let Ok(mut entries) = tokio::fs::read_dir(self.config.full_dir()).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_name().to_string_lossy().starts_with(&prefix) {
                    outputs.push(entry.path());
                }
            }
        }
        outputs
    }
}

fn subdirectory(backup_type: BackupType) -> &'static str {
    match backup_type {
        BackupType::Full => "full",
        BackupType::Incremental | BackupType::Differential => "incremental",
    }
}

fn log_outcome<T>(run: &JobRun, result: &Result<T>) {
    match result {
        Ok(_) => info!(job = %run.id(), elapsed_ms = run.elapsed_ms(), "Restore job finished"),
        Err(e) => error!(job = %run.id(), elapsed_ms = run.elapsed_ms(), error = %e, "Restore job failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ManualClock;
    use crate::remote::DirectoryMirror;
    use crate::testing::{test_config, FakeDatastore, Op};
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        clock: Arc<ManualClock>,
        datastore: Arc<FakeDatastore>,
        orchestrator: BackupOrchestrator,
    }

    fn harness_with(configure: impl FnOnce(&mut BackupConfig)) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        configure(&mut config);
        let clock = Arc::new(ManualClock::new(Utc::now() - Duration::days(1)));
        let cache = Arc::new(TtlCache::new(std::time::Duration::from_secs(60), 64, clock.clone()));
        let datastore = Arc::new(FakeDatastore::default());
        let remote: Option<Arc<dyn RemoteStorage>> = config
            .storage
            .remote_target
            .as_ref()
            .map(|root| Arc::new(DirectoryMirror::new(root)) as Arc<dyn RemoteStorage>);
        let orchestrator =
            BackupOrchestrator::new(config, datastore.clone(), cache, clock.clone(), remote).unwrap();
        Harness {
            _dir: dir,
            clock,
            datastore,
            orchestrator,
        }
    }

    fn harness() -> Harness {
        harness_with(|_| {})
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_full_backup_leaves_single_final_artifact() {
        let h = harness();
        let record = h.orchestrator.create_full_backup().await.unwrap();

        assert!(record.success);
        assert!(record.compressed);
        assert!(record.encrypted);
        assert!(!record.checksum.is_empty());
        assert!(record.path.to_string_lossy().ends_with(".sql.zst.enc"));
        assert_eq!(record.size, std::fs::metadata(&record.path).unwrap().len());

        let full_dir = h.orchestrator.config().full_dir();
        assert_eq!(files_in(&full_dir), vec![format!("{}.sql.zst.enc", record.id)]);
        assert!(files_in(&h.orchestrator.config().temp_dir()).is_empty());

        let stored = h.orchestrator.get_backup(&record.id).await.unwrap().unwrap();
        assert_eq!(stored, record);
        IntegrityVerifier::new()
            .verify(&record.path, &record.checksum)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_capture_is_recorded_and_next_job_runs() {
        let h = harness();
        h.datastore.fail_capture();
        let err = h.orchestrator.create_full_backup().await.unwrap_err();
        assert!(matches!(err, BackupError::Capture(_)));

        let records = h.orchestrator.list_backups().await.unwrap();
        assert_eq!(records.len(), 1);
        let failed = &records[0];
        assert!(!failed.success);
        assert_eq!(failed.size, 0);
        assert!(failed.checksum.is_empty());
        assert!(failed.error.as_deref().unwrap().contains("connection refused"));
        assert!(files_in(&h.orchestrator.config().full_dir()).is_empty());

        // The claim was released, so the next job is attempted and recorded too.
        assert!(h.orchestrator.jobs().active().is_empty());
        h.clock.advance(Duration::hours(1));
        let err = h.orchestrator.create_incremental_backup().await.unwrap_err();
        assert!(matches!(err, BackupError::Capture(_)));
        assert_eq!(h.datastore.ops(), vec![Op::DumpFull, Op::Capture]);
        assert_eq!(h.orchestrator.list_backups().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_incremental_windows_chain_from_previous_capture() {
        let h = harness();
        let full = h.orchestrator.create_full_backup().await.unwrap();

        h.clock.advance(Duration::hours(4));
        h.datastore.queue_changes(&[("0001.sql", "insert into students values (1);")]);
        let first = h.orchestrator.create_incremental_backup().await.unwrap();

        h.clock.advance(Duration::hours(4));
        h.datastore.queue_changes(&[("0002.sql", "insert into students values (2);")]);
        let second = h.orchestrator.create_incremental_backup().await.unwrap();

        let first_manifest = crate::datastore::SegmentManifest::read(&first.path).await.unwrap().unwrap();
        let second_manifest = crate::datastore::SegmentManifest::read(&second.path).await.unwrap().unwrap();
        assert_eq!(first_manifest.window_start, full.timestamp);
        assert_eq!(first_manifest.window_end, first.timestamp);
        assert_eq!(second_manifest.window_start, first.timestamp);

        assert!(!first.compressed && !first.encrypted);
        assert_eq!(
            first.checksum,
            IntegrityVerifier::new().checksum_tree(&first.path).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_point_in_time_replays_only_segments_up_to_target() {
        let h = harness();
        let (full, segments) = full_and_three_segments(&h).await;

        let target_time = segments[1].timestamp + Duration::hours(1);
        let report = h
            .orchestrator
            .point_in_time_restore(target_time, Some("school_pitr"))
            .await
            .unwrap();

        assert_eq!(report.backup_id, full.id);
        assert_eq!(report.replayed, vec![segments[0].id.clone(), segments[1].id.clone()]);
        let target = "school_pitr".to_string();
        assert_eq!(
            h.datastore.ops(),
            vec![
                Op::Recreate(target.clone()),
                Op::ApplyFull(target.clone()),
                Op::Replay { target: target.clone(), segment: segments[0].id.clone() },
                Op::Replay { target: target.clone(), segment: segments[1].id.clone() },
                Op::Validate(target),
            ]
        );
    }

    /// Full backup followed by three single-file incrementals, four hours apart.
    async fn full_and_three_segments(h: &Harness) -> (BackupMetadata, Vec<BackupMetadata>) {
        let full = h.orchestrator.create_full_backup().await.unwrap();
        let mut segments = Vec::new();
        for n in 1..=3 {
            h.clock.advance(Duration::hours(4));
            h.datastore.queue_changes(&[(&format!("{n:04}.sql"), "update students set id = id;")]);
            segments.push(h.orchestrator.create_incremental_backup().await.unwrap());
        }
        h.datastore.clear_ops();
        (full, segments)
    }

    #[tokio::test]
    async fn test_point_in_time_stops_at_failed_replay() {
        let h = harness();
        let (_, segments) = full_and_three_segments(&h).await;
        h.datastore.fail_replay_of(&segments[1].id);

        let target_time = segments[2].timestamp + Duration::hours(1);
        let err = h
            .orchestrator
            .point_in_time_restore(target_time, Some("school_pitr"))
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::Restore(_)));
        let target = "school_pitr".to_string();
        assert_eq!(
            h.datastore.ops(),
            vec![
                Op::Recreate(target.clone()),
                Op::ApplyFull(target.clone()),
                Op::Replay { target: target.clone(), segment: segments[0].id.clone() },
                Op::Replay { target, segment: segments[1].id.clone() },
            ]
        );
        assert!(h.orchestrator.jobs().active().is_empty());
    }

    #[tokio::test]
    async fn test_point_in_time_stops_before_corrupted_segment() {
        let h = harness();
        let (_, segments) = full_and_three_segments(&h).await;
        std::fs::write(segments[1].path.join("0002.sql"), "drop table students;").unwrap();

        let target_time = segments[2].timestamp + Duration::hours(1);
        let err = h
            .orchestrator
            .point_in_time_restore(target_time, Some("school_pitr"))
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::Integrity { .. }));
        let target = "school_pitr".to_string();
        assert_eq!(
            h.datastore.ops(),
            vec![
                Op::Recreate(target.clone()),
                Op::ApplyFull(target.clone()),
                Op::Replay { target, segment: segments[0].id.clone() },
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_apply_skips_validation() {
        let h = harness();
        let full = h.orchestrator.create_full_backup().await.unwrap();
        h.datastore.clear_ops();
        h.datastore.fail_apply();

        let err = h
            .orchestrator
            .restore_from_backup(&full.id, Some("school_copy"))
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::Restore(_)));
        assert_eq!(
            h.datastore.ops(),
            vec![
                Op::Recreate("school_copy".into()),
                Op::ApplyFull("school_copy".into()),
            ]
        );
        assert!(files_in(&h.orchestrator.config().temp_dir()).is_empty());
    }

    #[tokio::test]
    async fn test_point_in_time_without_baseline() {
        let h = harness();
        let err = h
            .orchestrator
            .point_in_time_restore(Utc::now(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::NoBaseline(_)));
    }

    #[tokio::test]
    async fn test_restore_refuses_failed_record() {
        let h = harness();
        h.datastore.fail_capture();
        let _ = h.orchestrator.create_full_backup().await;
        let failed = h.orchestrator.list_backups().await.unwrap().remove(0);

        let err = h
            .orchestrator
            .restore_from_backup(&failed.id, Some("school_restore"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::NotRestorable(_)));
    }

    #[tokio::test]
    async fn test_restore_decodes_and_validates() {
        let h = harness();
        let record = h.orchestrator.create_full_backup().await.unwrap();
        h.datastore.clear_ops();

        let report = h
            .orchestrator
            .restore_from_backup(&record.id, Some("school_restore"))
            .await
            .unwrap();
        assert!(report.validation.passed());
        assert_eq!(
            h.datastore.ops(),
            vec![
                Op::Recreate("school_restore".into()),
                Op::ApplyFull("school_restore".into()),
                Op::Validate("school_restore".into()),
            ]
        );
        assert!(files_in(&h.orchestrator.config().temp_dir()).is_empty());
    }

    #[tokio::test]
    async fn test_integrity_check_passes_and_drops_scratch_target() {
        let h = harness();
        let record = h.orchestrator.create_full_backup().await.unwrap();
        h.datastore.clear_ops();

        assert!(h.orchestrator.test_backup_integrity(&record.id).await.unwrap());

        let ops = h.datastore.ops();
        let Some(Op::Recreate(scratch)) = ops.first().cloned() else {
            panic!("expected a scratch restore, got {ops:?}");
        };
        assert!(scratch.starts_with(INTEGRITY_TARGET_PREFIX));
        assert_eq!(ops.last(), Some(&Op::Drop(scratch)));
    }

    #[tokio::test]
    async fn test_integrity_check_drops_scratch_target_after_failed_restore() {
        let h = harness();
        let record = h.orchestrator.create_full_backup().await.unwrap();
        h.datastore.fail_validation();
        h.datastore.clear_ops();

        assert!(!h.orchestrator.test_backup_integrity(&record.id).await.unwrap());
        assert!(matches!(h.datastore.ops().last(), Some(Op::Drop(_))));
    }

    #[tokio::test]
    async fn test_corrupted_byte_fails_integrity_without_restore() {
        let h = harness();
        let record = h.orchestrator.create_full_backup().await.unwrap();
        h.datastore.clear_ops();

        let mut bytes = std::fs::read(&record.path).unwrap();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0x01;
        std::fs::write(&record.path, bytes).unwrap();

        assert!(!h.orchestrator.test_backup_integrity(&record.id).await.unwrap());
        assert!(h.datastore.ops().is_empty());
    }

    #[tokio::test]
    async fn test_integrity_check_of_unknown_id_is_not_found() {
        let h = harness();
        let err = h.orchestrator.test_backup_integrity("full-missing").await.unwrap_err();
        assert!(matches!(err, BackupError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_full_and_frees_incremental_size() {
        let h = harness();
        let full = h.orchestrator.create_full_backup().await.unwrap();
        h.clock.advance(Duration::hours(1));
        h.datastore.queue_changes(&[("0001.sql", "insert into students values (1);")]);
        let incremental = h.orchestrator.create_incremental_backup().await.unwrap();

        h.clock.advance(Duration::days(45));
        let report = h.orchestrator.cleanup_old_backups().await.unwrap();
        assert_eq!(report.deleted_ids, vec![incremental.id.clone()]);
        assert_eq!(report.freed_space, incremental.size);
        assert!(!incremental.path.exists());
        assert!(full.path.exists());

        let again = h.orchestrator.cleanup_old_backups().await.unwrap();
        assert_eq!(again.deleted_count, 0);
    }

    #[tokio::test]
    async fn test_concurrent_capture_is_refused() {
        let h = harness();
        h.datastore.delay_capture(std::time::Duration::from_millis(200));
        let orchestrator = Arc::new(h.orchestrator);

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.create_full_backup().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        h.clock.advance(Duration::seconds(1));
        let err = orchestrator.create_incremental_backup().await.unwrap_err();
        assert!(matches!(err, BackupError::Busy(_)));
        assert!(orchestrator.jobs().is_held(&target_key("school")));

        assert!(running.await.unwrap().is_ok());
        // Only the completed full backup was recorded.
        assert_eq!(orchestrator.list_backups().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_and_records_failure() {
        let h = harness();
        h.datastore.delay_capture(std::time::Duration::from_secs(30));
        let orchestrator = Arc::new(h.orchestrator);

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.create_full_backup().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        orchestrator.shutdown();

        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(err, BackupError::Cancelled));
        let records = orchestrator.list_backups().await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert_eq!(records[0].error.as_deref(), Some("Operation cancelled"));
        assert!(files_in(&orchestrator.config().full_dir()).is_empty());
    }

    #[tokio::test]
    async fn test_stage_timeout_fails_only_that_job() {
        let h = harness_with(|config| config.timeouts.capture = 0);
        h.datastore.delay_capture(std::time::Duration::from_secs(5));

        let err = h.orchestrator.create_full_backup().await.unwrap_err();
        assert!(matches!(err, BackupError::Timeout { ref stage, .. } if stage == "capture"));
        assert!(h.orchestrator.jobs().active().is_empty());
    }

    #[tokio::test]
    async fn test_upload_copies_artifact_after_metadata() {
        let mirror = TempDir::new().unwrap();
        let root = mirror.path().to_path_buf();
        let h = harness_with(move |config| {
            config.storage.remote_target = Some(root.display().to_string())
        });

        let record = h.orchestrator.create_full_backup().await.unwrap();
        let name = record.path.file_name().unwrap();
        assert!(mirror.path().join("full").join(name).exists());
    }

    #[tokio::test]
    async fn test_status_reflects_recent_backups() {
        let h = harness();
        let status = h.orchestrator.get_backup_status().await;
        assert_eq!(status.health_status, crate::status::HealthStatus::Critical);

        let record = h.orchestrator.create_full_backup().await.unwrap();
        let status = h.orchestrator.get_backup_status().await;
        assert_eq!(status.health_status, crate::status::HealthStatus::Healthy);
        assert_eq!(status.total_backups, 1);
        assert_eq!(status.total_size, record.size);

        h.clock.advance(Duration::hours(49));
        let status = h.orchestrator.get_backup_status().await;
        assert_eq!(status.health_status, crate::status::HealthStatus::Critical);
        assert_eq!(status.issues, vec!["Last successful backup was 49 hours ago".to_string()]);
        assert_eq!(
            h.orchestrator.latest_full_backup().await.unwrap().map(|r| r.id),
            Some(record.id)
        );
    }
}
