//! Directory traversal for backup artifacts and change-log sources.
//!
//! Results are always sorted by their relative path so callers never depend
//! on the order the filesystem hands entries back in.

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// File names ending with any of these suffixes are skipped
    pub exclude_suffixes: Vec<String>,
}

/// A regular file discovered during a walk
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Last modification time
    pub modified: SystemTime,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let path = entry.path().to_path_buf();
        // Resolve symlinks to the real file; skip broken links and links to directories.
        let metadata = match std::fs::metadata(&path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if entry.path_is_symlink() && e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };

        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        Ok(Some(Self {
            path,
            relative_path,
            size: metadata.len(),
            modified: metadata.modified()?,
        }))
    }

    /// Relative path joined with `/` regardless of platform.
    pub fn relative_key(&self) -> String {
        self.relative_path
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Walk a directory tree and collect all regular files, sorted by relative path.
///
/// # Example
/// ```no_run
/// use backup_engine::fs::walker::{walk_directory, WalkOptions};
/// use std::path::Path;
///
/// let files = walk_directory(Path::new("/var/backups/incremental/run-1"), WalkOptions::default()).unwrap();
/// println!("Found {} files", files.len());
/// ```
pub fn walk_directory(root: &Path, options: WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();

    let mut walker = WalkDir::new(root).follow_links(options.follow_links);

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    for entry in walker {
        let entry = entry?;

        if entry.file_type().is_dir() || should_exclude(&entry, &options.exclude_suffixes) {
            continue;
        }

        if let Some(file_info) = FileInfo::from_entry(&entry, root)? {
            files.push(file_info);
        }
    }

    files.sort_by_key(|f| f.relative_key());
    Ok(files)
}

/// Calculate total size of all files in a directory
pub fn calculate_total_size(root: &Path) -> std::io::Result<u64> {
    Ok(walk_directory(root, WalkOptions::default())?
        .iter()
        .map(|f| f.size)
        .sum())
}

fn should_exclude(entry: &DirEntry, suffixes: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    suffixes.iter().any(|suffix| file_name.ends_with(suffix.as_str()))
}
