//! File metadata carried over from a copy's source to its destination.
//!
//! Only permission bits and access/modification times are preserved;
//! ownership is left to whoever runs the worker.

use filetime::FileTime;
use std::fs;
use std::path::Path;

/// Permission bits and timestamps of a file
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub permissions: fs::Permissions,
    pub accessed: FileTime,
    pub modified: FileTime,
}

impl FileMetadata {
    /// Extract metadata from a file path
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;

        Ok(Self {
            permissions: metadata.permissions(),
            accessed: FileTime::from_last_access_time(&metadata),
            modified: FileTime::from_last_modification_time(&metadata),
        })
    }

    /// Apply this metadata to a file
    pub fn apply_to_path(&self, path: &Path) -> std::io::Result<()> {
        fs::set_permissions(path, self.permissions.clone())?;
        filetime::set_file_times(path, self.accessed, self.modified)?;
        Ok(())
    }
}

/// Copy permission bits and timestamps from `src` onto `dest`.
pub fn copy_metadata(src: &Path, dest: &Path) -> std::io::Result<()> {
    FileMetadata::from_path(src)?.apply_to_path(dest)
}
