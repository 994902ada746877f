//! Off-site copies of finished artifacts.
//!
//! Two targets are supported: an S3-compatible bucket through the AWS SDK,
//! and a plain directory (typically a network mount).

use crate::config::BackupConfig;
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::utils::{BackupError, BestEffort, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const OBJECT_STORE_SCHEME: &str = "s3://";
const FILE_SCHEME: &str = "file://";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteTarget {
    ObjectStore { bucket: String, prefix: String },
    Directory(PathBuf),
}

impl RemoteTarget {
    /// Accepts `s3://bucket[/prefix]`, `file:///path` or an absolute path.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix(OBJECT_STORE_SCHEME) {
            let (bucket, prefix) = match rest.split_once('/') {
                Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
                None => (rest, ""),
            };
            if bucket.is_empty() {
                return Err(BackupError::Configuration(format!(
                    "remote target {raw:?} has no bucket"
                )));
            }
            return Ok(Self::ObjectStore {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
            });
        }

        let path = raw.strip_prefix(FILE_SCHEME).unwrap_or(raw);
        if path.is_empty() || !Path::new(path).is_absolute() {
            return Err(BackupError::Configuration(format!(
                "remote target {raw:?} must be s3://bucket[/prefix] or an absolute directory"
            )));
        }
        Ok(Self::Directory(PathBuf::from(path)))
    }
}

#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Copy the artifact at `path` to the target under `key`; returns the remote location.
    async fn upload(&self, path: &Path, key: &str, cancel: &CancellationToken) -> Result<String>;
}

/// S3 bucket storage. A file becomes one object; a run directory becomes
/// one object per file under `key/`.
pub struct S3Storage {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3Storage {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    /// Client from the standard AWS environment chain. A custom endpoint
    /// (MinIO, LocalStack) switches to path-style addressing.
    pub async fn from_env(
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        endpoint: Option<&str>,
    ) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(endpoint) = endpoint {
            debug!(endpoint = %endpoint, "Using custom S3 endpoint");
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if endpoint.is_some() {
            builder = builder.force_path_style(true);
        }
        Self::new(aws_sdk_s3::Client::from_conf(builder.build()), bucket, prefix)
    }

    fn object_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    fn location(&self, key: &str) -> String {
        format!("{}{}/{}", OBJECT_STORE_SCHEME, self.bucket, self.object_key(key))
    }

    async fn put(&self, file: &Path, object_key: &str, cancel: &CancellationToken) -> Result<()> {
        let body = ByteStream::from_path(file)
            .await
            .map_err(|e| BackupError::Remote(format!("failed to read {}: {e}", file.display())))?;

        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(object_key)
            .body(body)
            .send();

        tokio::select! {
            sent = request => {
                sent.map_err(|e| BackupError::Remote(format!("put_object {object_key} failed: {e}")))?;
            }
            _ = cancel.cancelled() => return Err(BackupError::Cancelled),
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStorage for S3Storage {
    async fn upload(&self, path: &Path, key: &str, cancel: &CancellationToken) -> Result<String> {
        let objects = upload_plan(path, key).await?;
        for (file, relative_key) in &objects {
            if cancel.is_cancelled() {
                return Err(BackupError::Cancelled);
            }
            self.put(file, &self.object_key(relative_key), cancel).await?;
        }

        let location = self.location(key);
        info!(location = %location, objects = objects.len(), "Uploaded artifact");
        Ok(location)
    }
}

/// Files to send for `path` and the key each one lands under.
async fn upload_plan(path: &Path, key: &str) -> Result<Vec<(PathBuf, String)>> {
    if !tokio::fs::metadata(path).await?.is_dir() {
        return Ok(vec![(path.to_path_buf(), key.to_string())]);
    }

    let root = path.to_path_buf();
    let files = tokio::task::spawn_blocking(move || walk_directory(&root, WalkOptions::default()))
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;
    Ok(files
        .into_iter()
        .map(|f| {
            let object = format!("{}/{}", key.trim_end_matches('/'), f.relative_key());
            (f.path, object)
        })
        .collect())
}

/// Copies artifacts into a directory. Each copy lands under a `.partial`
/// name first and is renamed once complete.
pub struct DirectoryMirror {
    root: PathBuf,
}

impl DirectoryMirror {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl RemoteStorage for DirectoryMirror {
    async fn upload(&self, path: &Path, key: &str, cancel: &CancellationToken) -> Result<String> {
        let dest = self.root.join(key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = PathBuf::from(format!("{}.partial", dest.display()));
        crate::fs::remove_path(&staging).await?;

        let copied = if tokio::fs::metadata(path).await?.is_dir() {
            copy_tree(path, &staging, cancel).await
        } else {
            tokio::fs::copy(path, &staging).await.map(|_| ()).map_err(BackupError::from)
        };
        if let Err(e) = copied {
            BestEffort::new().run(
                "remove_mirror_staging",
                &staging.display().to_string(),
                crate::fs::remove_path(&staging).await,
            );
            return Err(match e {
                BackupError::Cancelled => BackupError::Cancelled,
                other => BackupError::Remote(format!("{}: {}", dest.display(), other)),
            });
        }

        crate::fs::remove_path(&dest).await?;
        tokio::fs::rename(&staging, &dest).await?;
        debug!(dest = %dest.display(), "Mirrored artifact");
        Ok(dest.display().to_string())
    }
}

async fn copy_tree(src: &Path, dest: &Path, cancel: &CancellationToken) -> Result<()> {
    let root = src.to_path_buf();
    let files = tokio::task::spawn_blocking(move || walk_directory(&root, WalkOptions::default()))
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;

    tokio::fs::create_dir_all(dest).await?;
    for file in files {
        if cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        let target = dest.join(&file.relative_path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&file.path, &target).await?;
    }
    Ok(())
}

/// Build the configured remote target, if any.
pub async fn from_config(config: &BackupConfig) -> Result<Option<Arc<dyn RemoteStorage>>> {
    let Some(raw) = &config.storage.remote_target else {
        return Ok(None);
    };
    let storage: Arc<dyn RemoteStorage> = match RemoteTarget::parse(raw)? {
        RemoteTarget::ObjectStore { bucket, prefix } => Arc::new(
            S3Storage::from_env(bucket, prefix, config.storage.remote_endpoint.as_deref()).await,
        ),
        RemoteTarget::Directory(root) => Arc::new(DirectoryMirror::new(root)),
    };
    Ok(Some(storage))
}
