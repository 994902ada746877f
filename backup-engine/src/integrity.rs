//! Reproducible SHA-256 content hashes for artifacts.
//!
//! `checksum` hashes a single file. `checksum_tree` hashes a directory: each
//! file is hashed, the `<hash>  <relative/path>` lines are sorted by path and
//! the joined listing is hashed again. The result depends only on file names
//! and contents, never on filesystem iteration order.

use crate::fs::walker::{walk_directory, WalkOptions};
use crate::utils::{BackupError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

const READ_BUFFER: usize = 64 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct IntegrityVerifier;

impl IntegrityVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Hex SHA-256 of a single file.
    pub async fn checksum(&self, path: &Path) -> Result<String> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || hash_file(&path))
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))?
    }

    /// Hex SHA-256 over the sorted per-file hashes of a directory tree.
    pub async fn checksum_tree(&self, dir: &Path) -> Result<String> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || hash_tree(&dir))
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))?
    }

    /// Checksum of whatever is at `path`: tree hash for directories, file hash otherwise.
    pub async fn checksum_artifact(&self, path: &Path) -> Result<String> {
        if tokio::fs::metadata(path).await?.is_dir() {
            self.checksum_tree(path).await
        } else {
            self.checksum(path).await
        }
    }

    /// Recompute the artifact hash and compare. A mismatch is an `Integrity` error.
    pub async fn verify(&self, path: &Path, expected: &str) -> Result<()> {
        let actual = self.checksum_artifact(path).await?;
        if actual != expected {
            return Err(BackupError::Integrity {
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn hash_tree(dir: &Path) -> Result<String> {
    if !dir.is_dir() {
        return Err(BackupError::NotFound(dir.display().to_string()));
    }

    let mut lines = Vec::new();
    for file in walk_directory(dir, WalkOptions::default())? {
        lines.push((file.relative_key(), hash_file(&file.path)?));
    }
    lines.sort();

    let mut hasher = Sha256::new();
    for (relative, hash) in &lines {
        hasher.update(hash.as_bytes());
        hasher.update(b"  ");
        hasher.update(relative.as_bytes());
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}
