//! Manifest written into every incremental run directory.
//!
//! The manifest pins the capture window of the segment and the order its
//! files must be replayed in, so a restore never has to infer either from
//! file timestamps.

use crate::utils::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MANIFEST_FILE: &str = "segment.json";
const MANIFEST_VERSION: u32 = 1;

/// Serialized as `segment.json` in each incremental run directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentManifest {
    pub version: u32,
    /// Exclusive lower bound of the captured change window
    pub window_start: DateTime<Utc>,
    /// Inclusive upper bound; equals the backup record's timestamp
    pub window_end: DateTime<Utc>,
    /// Replay order
    pub files: Vec<SegmentEntry>,
    pub total_files: usize,
    pub total_bytes: u64,
}

/// A single change-log file inside the segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentEntry {
    /// Path relative to the run directory, `/`-separated
    pub name: String,
    pub size: u64,
    pub mtime: i64,
}

impl SegmentManifest {
    pub fn new(
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        files: Vec<SegmentEntry>,
    ) -> Self {
        Self {
            version: MANIFEST_VERSION,
            window_start,
            window_end,
            total_files: files.len(),
            total_bytes: files.iter().map(|f| f.size).sum(),
            files,
        }
    }

    pub async fn write(&self, run_dir: &Path) -> Result<()> {
        let body = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(run_dir.join(MANIFEST_FILE), body).await?;
        Ok(())
    }

    /// Read the manifest of a run directory. `None` if the directory has none.
    pub async fn read(run_dir: &Path) -> Result<Option<Self>> {
        let path = run_dir.join(MANIFEST_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let manifest: Self = serde_json::from_slice(&bytes)?;
        if manifest.version > MANIFEST_VERSION {
            return Err(BackupError::Restore(format!(
                "{} has unsupported manifest version {}",
                path.display(),
                manifest.version
            )));
        }
        Ok(Some(manifest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_manifest_totals_and_persistence() {
        let dir = TempDir::new().unwrap();
        let start = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 10, 1, 4, 0, 0).unwrap();
        let manifest = SegmentManifest::new(
            start,
            end,
            vec![
                SegmentEntry { name: "0001.sql".into(), size: 10, mtime: 1 },
                SegmentEntry { name: "0002.sql".into(), size: 5, mtime: 2 },
            ],
        );
        assert_eq!(manifest.total_files, 2);
        assert_eq!(manifest.total_bytes, 15);

        manifest.write(dir.path()).await.unwrap();
        let loaded = SegmentManifest::read(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded, manifest);
    }

    #[tokio::test]
    async fn test_missing_manifest_reads_as_none() {
        let dir = TempDir::new().unwrap();
        assert!(SegmentManifest::read(dir.path()).await.unwrap().is_none());
    }
}
