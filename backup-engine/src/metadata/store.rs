//! Durable, write-through metadata storage.
//!
//! Each record lives in `logs/<id>.json`. Writes go to a temp file that is
//! renamed into place, then the cache is updated. Point lookups consult the
//! cache first; listings always scan the directory.

use super::cache::MetadataCache;
use super::BackupMetadata;
use crate::utils::{BackupError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const RECORD_EXTENSION: &str = "json";

pub struct MetadataStore {
    logs_dir: PathBuf,
    cache: Arc<dyn MetadataCache>,
    // Held for writing by save/delete so a lookup can never repopulate the
    // cache with a record that is being removed.
    gate: RwLock<()>,
}

impl MetadataStore {
    pub fn new(logs_dir: impl Into<PathBuf>, cache: Arc<dyn MetadataCache>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            cache,
            gate: RwLock::new(()),
        }
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    fn record_path(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(BackupError::NotFound(id.to_string()));
        }
        Ok(self.logs_dir.join(format!("{}.{}", id, RECORD_EXTENSION)))
    }

    /// Persist a record durably, then refresh the cache.
    pub async fn save(&self, record: &BackupMetadata) -> Result<()> {
        let path = self.record_path(&record.id)?;
        let body = serde_json::to_vec_pretty(record)?;

        let _guard = self.gate.write().await;
        tokio::fs::create_dir_all(&self.logs_dir).await?;

        let tmp = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;

        self.cache.put(record.clone());
        debug!(backup_id = %record.id, success = record.success, "Metadata saved");
        Ok(())
    }

    /// Cached point lookup with durable fallback.
    pub async fn get(&self, id: &str) -> Result<Option<BackupMetadata>> {
        let path = self.record_path(id)?;
        if let Some(record) = self.cache.get(id) {
            return Ok(Some(record));
        }

        let _guard = self.gate.read().await;
        let record = match read_record(&path).await? {
            Some(record) => record,
            None => return Ok(None),
        };
        self.cache.put(record.clone());
        Ok(Some(record))
    }

    /// Lookup that treats absence as an error.
    pub async fn require(&self, id: &str) -> Result<BackupMetadata> {
        self.get(id)
            .await?
            .ok_or_else(|| BackupError::NotFound(id.to_string()))
    }

    /// Every durable record, newest first. Never served from the cache.
    pub async fn list(&self) -> Result<Vec<BackupMetadata>> {
        let mut records = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.logs_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            match read_record(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable metadata record"),
            }
        }

        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records)
    }

    /// Remove the durable record and the cache entry. Returns false if absent.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let path = self.record_path(id)?;
        let _guard = self.gate.write().await;
        self.cache.remove(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.get(id).await?.is_some())
    }
}

async fn read_record(path: &Path) -> Result<Option<BackupMetadata>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}
