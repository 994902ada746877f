//! Applying backups to a target database.
//!
//! Every artifact is checked against its recorded checksum before anything
//! on the target is touched. Point-in-time recovery restores a full baseline
//! and then replays incremental segments strictly in capture order; the
//! [`ReplayCursor`] refuses anything that would break that order.

use crate::archive::ArchiveEncoder;
use crate::config::TimeoutConfig;
use crate::datastore::{validate_target_name, Datastore, SegmentManifest, ValidationReport};
use crate::integrity::IntegrityVerifier;
use crate::jobs::with_timeout;
use crate::metadata::{BackupMetadata, BackupType};
use crate::utils::{BackupError, BestEffort, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What a point-in-time restore will apply, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PitrPlan {
    pub target_time: DateTime<Utc>,
    pub baseline: BackupMetadata,
    pub segments: Vec<BackupMetadata>,
}

/// Pick the baseline and the segments for recovery to `target_time`.
///
/// The baseline is the newest successful full backup strictly before
/// `target_time`. Segments are the successful incrementals stamped within
/// `[baseline.timestamp, target_time]`, oldest first.
pub fn plan_point_in_time(records: &[BackupMetadata], target_time: DateTime<Utc>) -> Result<PitrPlan> {
    let baseline = records
        .iter()
        .filter(|r| r.is_full() && r.is_restorable() && r.timestamp < target_time)
        .max_by_key(|r| r.timestamp)
        .cloned()
        .ok_or_else(|| BackupError::NoBaseline(target_time.to_rfc3339()))?;

    let mut segments: Vec<BackupMetadata> = records
        .iter()
        .filter(|r| {
            r.backup_type == BackupType::Incremental
                && r.is_restorable()
                && r.timestamp >= baseline.timestamp
                && r.timestamp <= target_time
        })
        .cloned()
        .collect();
    segments.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

    Ok(PitrPlan {
        target_time,
        baseline,
        segments,
    })
}

/// Position of a replay. Each admitted segment must be strictly newer than
/// the last one and, when it carries a manifest, its window must begin
/// exactly where the previous capture ended.
#[derive(Debug, Clone, Copy)]
pub struct ReplayCursor {
    position: DateTime<Utc>,
}

impl ReplayCursor {
    pub fn new(baseline: DateTime<Utc>) -> Self {
        Self { position: baseline }
    }

    pub fn position(&self) -> DateTime<Utc> {
        self.position
    }

    pub fn admit(&mut self, segment: &BackupMetadata, manifest: Option<&SegmentManifest>) -> Result<()> {
        if segment.timestamp <= self.position {
            return Err(BackupError::OutOfOrder {
                segment: segment.id.clone(),
                detail: format!(
                    "captured at {} which is not after {}",
                    segment.timestamp, self.position
                ),
            });
        }
        if let Some(manifest) = manifest {
            if manifest.window_start != self.position {
                let kind = if manifest.window_start > self.position { "gap" } else { "overlap" };
                return Err(BackupError::OutOfOrder {
                    segment: segment.id.clone(),
                    detail: format!(
                        "{kind}: window starts at {} but replay is at {}",
                        manifest.window_start, self.position
                    ),
                });
            }
        }
        self.position = segment.timestamp;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub backup_id: String,
    pub target: String,
    /// Incremental ids replayed, in order
    pub replayed: Vec<String>,
    pub validation: ValidationReport,
}

pub struct RestoreEngine {
    datastore: Arc<dyn Datastore>,
    encoder: Arc<ArchiveEncoder>,
    verifier: IntegrityVerifier,
    temp_dir: PathBuf,
    timeouts: TimeoutConfig,
}

impl RestoreEngine {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        encoder: Arc<ArchiveEncoder>,
        temp_dir: impl Into<PathBuf>,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            datastore,
            encoder,
            verifier: IntegrityVerifier::new(),
            temp_dir: temp_dir.into(),
            timeouts,
        }
    }

    /// Restore one full backup into `target` and validate it.
    pub async fn restore(
        &self,
        record: &BackupMetadata,
        target: &str,
        recreate: bool,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        self.apply_baseline(record, target, recreate, cancel).await?;
        let validation = self.validate(target, cancel).await?;
        info!(backup_id = %record.id, target, "Restore completed");
        Ok(RestoreReport {
            backup_id: record.id.clone(),
            target: target.to_string(),
            replayed: Vec::new(),
            validation,
        })
    }

    /// Restore the plan's baseline, replay its segments in order, validate.
    /// Any failing segment aborts the whole recovery.
    pub async fn point_in_time(
        &self,
        plan: &PitrPlan,
        target: &str,
        recreate: bool,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        self.apply_baseline(&plan.baseline, target, recreate, cancel).await?;

        let mut cursor = ReplayCursor::new(plan.baseline.timestamp);
        let mut replayed = Vec::with_capacity(plan.segments.len());
        for segment in &plan.segments {
            self.replay(segment, target, &mut cursor, cancel).await?;
            replayed.push(segment.id.clone());
        }

        let validation = self.validate(target, cancel).await?;
        info!(
            baseline = %plan.baseline.id,
            segments = replayed.len(),
            target_time = %plan.target_time,
            target,
            "Point-in-time restore completed"
        );
        Ok(RestoreReport {
            backup_id: plan.baseline.id.clone(),
            target: target.to_string(),
            replayed,
            validation,
        })
    }

    /// Replay one incremental segment after checking its checksum and order.
    pub async fn replay(
        &self,
        segment: &BackupMetadata,
        target: &str,
        cursor: &mut ReplayCursor,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !segment.is_restorable() {
            return Err(BackupError::NotRestorable(segment.id.clone()));
        }
        with_timeout(
            "restore",
            self.timeouts.restore(),
            self.verifier.verify(&segment.path, &segment.checksum),
        )
        .await?;

        let manifest = SegmentManifest::read(&segment.path).await?;
        cursor.admit(segment, manifest.as_ref())?;

        info!(segment = %segment.id, target, "Replaying segment");
        with_timeout(
            "restore",
            self.timeouts.restore(),
            self.datastore.replay_segment(&segment.path, target, cancel),
        )
        .await
    }

    /// Run the post-restore probes; any failed probe is a `Validation` error.
    pub async fn validate(&self, target: &str, cancel: &CancellationToken) -> Result<ValidationReport> {
        with_timeout(
            "validate",
            self.timeouts.validate(),
            self.datastore.validate(target, cancel),
        )
        .await?
        .into_result()
    }

    async fn apply_baseline(
        &self,
        record: &BackupMetadata,
        target: &str,
        recreate: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !record.is_restorable() {
            return Err(BackupError::NotRestorable(record.id.clone()));
        }
        if !record.is_full() {
            return Err(BackupError::Restore(format!(
                "{} is {} and can only be applied by a point-in-time restore",
                record.id, record.backup_type
            )));
        }
        validate_target_name(target)?;

        // Nothing is decoded or touched before the stored form checks out.
        with_timeout(
            "restore",
            self.timeouts.restore(),
            self.verifier.verify(&record.path, &record.checksum),
        )
        .await?;

        let work_dir = self.temp_dir.join(format!("restore-{}", uuid::Uuid::new_v4()));
        let result = self.decode_and_apply(record, target, recreate, &work_dir, cancel).await;

        let mut best_effort = BestEffort::new();
        best_effort.run(
            "remove_work_dir",
            &work_dir.display().to_string(),
            crate::fs::remove_path(&work_dir).await,
        );
        if let Err(e) = &result {
            warn!(backup_id = %record.id, target, error = %e, "Restore failed, target needs manual attention");
        }
        result
    }

    async fn decode_and_apply(
        &self,
        record: &BackupMetadata,
        target: &str,
        recreate: bool,
        work_dir: &std::path::Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let limit = if record.encrypted {
            self.timeouts.encrypt() + self.timeouts.compress()
        } else {
            self.timeouts.compress()
        };
        let plain = with_timeout(
            "decode",
            limit,
            self.encoder
                .unpack(&record.path, record.compressed, record.encrypted, work_dir),
        )
        .await?;

        if recreate {
            with_timeout(
                "restore",
                self.timeouts.restore(),
                self.datastore.recreate(target, cancel),
            )
            .await?;
        }

        info!(backup_id = %record.id, target, "Applying full backup");
        with_timeout(
            "restore",
            self.timeouts.restore(),
            self.datastore.apply_full(&plain, target, cancel),
        )
        .await
    }
}
