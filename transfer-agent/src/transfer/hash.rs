//! Streaming content hashing and copy-with-hash.
//!
//! Digests are SHA-1 hex strings. They fingerprint content for transfer
//! verification and are not meant to resist a deliberate collision.

use sha1::{Digest, Sha1};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::progress::{format_bytes, ProgressLog};
use crate::config::SyncConfig;
use crate::fs::metadata::copy_metadata;

/// Block size and progress cadence for streaming operations
#[derive(Debug, Clone)]
pub struct HashOptions {
    pub block_size: usize,
    pub progress_interval: Duration,
}

impl Default for HashOptions {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for HashOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            block_size: config.block_size.max(1),
            progress_interval: config.progress_interval(),
        }
    }
}

/// Digest and length of a streamed file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashResult {
    /// Lowercase hex digest
    pub digest: String,

    /// Bytes actually read
    pub byte_count: u64,
}

/// Hash a file in fixed-size blocks.
pub fn hash_file(path: &Path, options: &HashOptions) -> io::Result<HashResult> {
    info!("About to hash {}", path.display());

    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    info!("There are {} to hash", format_bytes(size));

    let mut progress = ProgressLog::new("Hashed", size, options.progress_interval);
    let result = stream_blocks(&mut file, options.block_size, &mut progress, |_| Ok(()))?;
    progress.finish(result.byte_count);

    Ok(result)
}

/// Copy `src` to `dest`, hashing the bytes as they are written.
///
/// Data goes to a temporary sibling of `dest`, is forced to disk, gets the
/// source's permissions and timestamps, and is then renamed over `dest`.
/// `dest` therefore either keeps its previous state or is a complete copy.
pub fn copy_with_hash(src: &Path, dest: &Path, options: &HashOptions) -> io::Result<HashResult> {
    let tmp_path = temp_path_for(dest)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    info!("About to copy {} to {}", src.display(), tmp_path.display());

    let result = copy_to_temp(src, &tmp_path, options).inspect_err(|_| {
        if let Err(e) = fs::remove_file(&tmp_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", tmp_path.display(), e);
            }
        }
    })?;

    info!("Renaming {} to {}", tmp_path.display(), dest.display());
    fs::rename(&tmp_path, dest)?;
    sync_parent_dir(dest)?;
    info!("Renamed {} to {}", tmp_path.display(), dest.display());

    Ok(result)
}

fn copy_to_temp(src: &Path, tmp_path: &Path, options: &HashOptions) -> io::Result<HashResult> {
    let mut reader = File::open(src)?;
    let size = reader.metadata()?.len();
    info!("There are {} to copy", format_bytes(size));

    let mut writer = File::create(tmp_path)?;
    let mut progress = ProgressLog::new("Copied", size, options.progress_interval);
    let result = stream_blocks(&mut reader, options.block_size, &mut progress, |block| {
        writer.write_all(block)
    })?;
    progress.finish(result.byte_count);

    info!("Copy complete; about to synchronize file to disk");
    writer.flush()?;
    writer.sync_all()?;
    drop(writer);
    info!("File synchronized to disk");

    copy_metadata(src, tmp_path)?;
    info!("Copied file metadata from {} to {}", src.display(), tmp_path.display());

    Ok(result)
}

/// Read `reader` to the end in `block_size` blocks, hashing each block and
/// handing it to `sink`.
fn stream_blocks<R, F>(
    reader: &mut R,
    block_size: usize,
    progress: &mut ProgressLog,
    mut sink: F,
) -> io::Result<HashResult>
where
    R: Read,
    F: FnMut(&[u8]) -> io::Result<()>,
{
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; block_size];
    let mut byte_count = 0u64;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        hasher.update(&buf[..n]);
        sink(&buf[..n])?;
        byte_count += n as u64;
        progress.update(byte_count);
    }

    Ok(HashResult {
        digest: hex::encode(hasher.finalize()),
        byte_count,
    })
}

/// Hidden sibling used while `dest` is being written, e.g. `dir/.a.txt.tmp`.
pub fn temp_path_for(dest: &Path) -> io::Result<PathBuf> {
    let file_name = dest.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", dest.display()),
        )
    })?;

    let mut tmp_name = OsString::from(".");
    tmp_name.push(file_name);
    tmp_name.push(".tmp");
    Ok(dest.with_file_name(tmp_name))
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => File::open(parent)?.sync_all(),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}
