//! Filesystem helpers shared by capture, cleanup and verification.

pub mod walker;

use std::path::Path;

/// Remove a file or a whole directory tree. A missing path is not an error.
pub async fn remove_path(path: &Path) -> std::io::Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}

/// Size in bytes of a file, or the sum of all files below a directory.
pub async fn path_size(path: &Path) -> std::io::Result<u64> {
    let metadata = tokio::fs::metadata(path).await?;
    if metadata.is_dir() {
        let root = path.to_path_buf();
        tokio::task::spawn_blocking(move || walker::calculate_total_size(&root))
            .await
            .map_err(std::io::Error::other)?
    } else {
        Ok(metadata.len())
    }
}
