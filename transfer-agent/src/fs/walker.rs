//! Directory traversal for file inventories.
//!
//! Walks a tree lazily, following symlinks into directories and yielding only
//! regular files. Walking is read-only, so a scan can be restarted simply by
//! calling [`scan`] again.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory scanning
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Skip files larger than this many bytes (test mode)
    pub max_file_size: Option<u64>,
}

impl ScanOptions {
    /// Options for test and validation runs: only small files are listed.
    pub fn test_mode(max_file_size: u64) -> Self {
        Self {
            max_file_size: Some(max_file_size),
        }
    }
}

/// A regular file discovered during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Path to the file, rooted at the scan root
    pub path: PathBuf,

    /// File size in bytes
    pub size: u64,
}

impl FileInfo {
    /// Returns None for anything that is not a regular file once symlinks
    /// are resolved.
    fn from_entry(entry: &DirEntry) -> std::io::Result<Option<Self>> {
        // With follow_links, metadata() describes the link target.
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            return Ok(None);
        }

        Ok(Some(Self {
            path: entry.path().to_path_buf(),
            size: metadata.len(),
        }))
    }
}

/// Lazily scan `root` for regular files.
///
/// A root that does not exist yields nothing: the remote side of a first
/// synchronization legitimately has no tree yet.
pub fn scan(root: &Path, options: ScanOptions) -> Scan {
    let walker = if root.exists() {
        Some(
            WalkDir::new(root)
                .follow_links(true)
                .sort_by_file_name()
                .into_iter(),
        )
    } else {
        None
    };

    Scan { walker, options }
}

/// Iterator returned by [`scan`].
pub struct Scan {
    walker: Option<walkdir::IntoIter>,
    options: ScanOptions,
}

impl Iterator for Scan {
    type Item = std::io::Result<FileInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        let walker = self.walker.as_mut()?;

        loop {
            let entry = match walker.next()? {
                Ok(entry) => entry,
                Err(e) if is_broken_link(&e) => continue,
                Err(e) => return Some(Err(e.into())),
            };

            if entry.file_type().is_dir() {
                continue;
            }

            let file = match FileInfo::from_entry(&entry) {
                Ok(Some(file)) => file,
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            };

            if let Some(max) = self.options.max_file_size {
                if file.size > max {
                    continue;
                }
            }

            return Some(Ok(file));
        }
    }
}

/// Dangling symlinks are not regular files; skip them rather than fail.
fn is_broken_link(err: &walkdir::Error) -> bool {
    let not_found = err
        .io_error()
        .is_some_and(|e| e.kind() == std::io::ErrorKind::NotFound);
    not_found && err.path().is_some_and(|p| p.symlink_metadata().is_ok())
}
