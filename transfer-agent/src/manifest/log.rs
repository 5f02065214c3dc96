//! Append-only manifest files.
//!
//! The sync log is the only shared mutable state of a synchronization. Every
//! append is written with a single `write_all` on an append-mode handle and
//! forced to stable storage before returning, so a reader never observes a
//! line that its writer did not consider committed.
//!
//! There is no lock: callers must not run two appenders against the same log
//! at the same time. The dispatcher's scheduling guarantees this.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{Entry, ManifestEntry, Metadata};
use crate::utils::errors::{Result, TransferError};

/// Handle to an append-only manifest file on disk.
#[derive(Debug, Clone)]
pub struct SyncLog {
    path: PathBuf,
}

impl SyncLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory the log lives in.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Create the log (and its parent directories) if it does not exist yet.
    pub fn ensure_exists(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        Ok(())
    }

    /// Append a batch of entries as one durable write.
    pub fn append(&self, entries: &[ManifestEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&entry.to_line()?);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(buf.as_bytes())?;
        file.flush()?;
        file.sync_all()?;

        debug!("Appended {} entries to {}", entries.len(), self.path.display());
        Ok(())
    }

    pub fn append_one(&self, entry: impl Into<ManifestEntry>) -> Result<()> {
        self.append(&[entry.into()])
    }

    /// Read the log from the start. Each call re-opens the file, so the
    /// returned sequence can be restarted at will.
    pub fn entries(&self) -> Result<ManifestReader> {
        ManifestReader::open(&self.path)
    }
}

/// Lazy iterator over `(entry, line_number)` pairs of a manifest file.
///
/// Blank lines and `#` comments are skipped. A line that fails to parse ends
/// the read with [`TransferError::MalformedLine`].
pub struct ManifestReader {
    path: PathBuf,
    reader: BufReader<File>,
    buf: Vec<u8>,
    line_number: usize,
    failed: bool,
}

impl ManifestReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            buf: Vec::new(),
            line_number: 0,
            failed: false,
        })
    }

    fn malformed(&self, line: String, reason: String) -> TransferError {
        TransferError::MalformedLine {
            path: self.path.clone(),
            line_number: self.line_number,
            line,
            reason,
        }
    }
}

impl Iterator for ManifestReader {
    type Item = Result<(ManifestEntry, usize)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e.into()));
                }
            }
            self.line_number += 1;

            let line = match std::str::from_utf8(&self.buf) {
                Ok(line) => line,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(self.malformed(
                        String::from_utf8_lossy(&self.buf).trim().to_string(),
                        e.to_string(),
                    )));
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            return match ManifestEntry::parse(trimmed) {
                Ok(entry) => Some(Ok((entry, self.line_number))),
                Err(e) => {
                    let line = trimmed.to_string();
                    self.failed = true;
                    Some(Err(self.malformed(line, e.to_string())))
                }
            };
        }
    }
}

/// Write a single-entry metadata file, replacing any previous one.
pub fn write_metadata_file(path: &Path, metadata: Metadata) -> Result<()> {
    let entry = metadata.into_entry();
    info!("File metadata: {}", entry);

    let mut file = File::create(path)?;
    file.write_all(entry.to_line()?.as_bytes())?;
    file.sync_all()?;

    info!("Wrote metadata file {}", path.display());
    Ok(())
}

/// Read a worker metadata file, refusing anything larger than `size_limit`.
pub fn read_metadata_file(path: &Path, size_limit: u64) -> Result<Metadata> {
    let size = fs::metadata(path)?.len();
    if size > size_limit {
        return Err(TransferError::InvalidManifestEntry(format!(
            "Metadata file {} is too large ({} bytes, limit {})",
            path.display(),
            size,
            size_limit
        )));
    }

    let (entry, _) = ManifestReader::open(path)?.next().ok_or_else(|| {
        TransferError::InvalidManifestEntry(format!("Metadata file {} is empty", path.display()))
    })??;

    entry.expect::<Metadata>()
}
