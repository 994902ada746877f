//! In-process fixtures for route and scheduler tests.

use crate::state::AppState;
use async_trait::async_trait;
use axum::body::to_bytes;
use axum::response::Response;
use backup_engine::datastore::{
    CaptureWindow, Datastore, SegmentManifest, ValidationCheck, ValidationReport,
};
use backup_engine::metadata::{SystemClock, TtlCache};
use backup_engine::{BackupConfig, BackupOrchestrator};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Datastore whose dumps and captures are tiny local files.
pub struct StubDatastore;

#[async_trait]
impl Datastore for StubDatastore {
    fn primary(&self) -> &str {
        "school"
    }

    async fn dump_full(&self, out: &Path, _cancel: &CancellationToken) -> backup_engine::Result<()> {
        tokio::fs::write(out, "CREATE TABLE students (id int);\n").await?;
        Ok(())
    }

    async fn capture_changes(
        &self,
        window: CaptureWindow,
        out_dir: &Path,
        _cancel: &CancellationToken,
    ) -> backup_engine::Result<SegmentManifest> {
        tokio::fs::create_dir_all(out_dir).await?;
        Ok(SegmentManifest::new(window.start, window.end, Vec::new()))
    }

    async fn recreate(&self, _target: &str, _cancel: &CancellationToken) -> backup_engine::Result<()> {
        Ok(())
    }

    async fn drop_target(&self, _target: &str, _cancel: &CancellationToken) -> backup_engine::Result<()> {
        Ok(())
    }

    async fn apply_full(
        &self,
        _artifact: &Path,
        _target: &str,
        _cancel: &CancellationToken,
    ) -> backup_engine::Result<()> {
        Ok(())
    }

    async fn replay_segment(
        &self,
        _segment_dir: &Path,
        _target: &str,
        _cancel: &CancellationToken,
    ) -> backup_engine::Result<()> {
        Ok(())
    }

    async fn validate(
        &self,
        _target: &str,
        _cancel: &CancellationToken,
    ) -> backup_engine::Result<ValidationReport> {
        Ok(ValidationReport {
            checks: vec![ValidationCheck {
                name: "connectivity".into(),
                passed: true,
                detail: "ok".into(),
            }],
        })
    }
}

pub struct Harness {
    pub state: Arc<AppState>,
    _dir: TempDir,
}

pub fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = BackupConfig::default();
    config.datastore.database = "school".into();
    config.storage.backup_dir = dir.path().join("backups");

    let clock = Arc::new(SystemClock);
    let cache = Arc::new(TtlCache::new(Duration::from_secs(300), 64, clock.clone()));
    let orchestrator =
        BackupOrchestrator::new(config, Arc::new(StubDatastore), cache, clock, None).unwrap();

    Harness {
        state: Arc::new(AppState::new(Arc::new(orchestrator))),
        _dir: dir,
    }
}

pub async fn read_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
