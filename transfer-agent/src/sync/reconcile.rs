//! Replay of the sync log.
//!
//! A [`Reconciler`] consumes log entries in order and tracks the open epoch:
//! the files still outstanding, the work counters copied from the epoch's
//! `SYNC_REQUEST`, and any verified file whose size on disk no longer matches.
//! [`reconcile`] drives a full pass and closes the epoch when all work is done.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::manifest::log::SyncLog;
use crate::manifest::{FileRef, ManifestEntry, SyncDone, SyncRequest, TransferVerified};
use crate::utils::errors::{Result, TransferError};

/// Work counters of the open epoch.
///
/// Signed so that an over-verified log shows up as a negative count rather
/// than wrapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub files_to_transfer: i64,
    pub bytes_to_transfer: i64,
    pub files_to_verify: i64,
    pub bytes_to_verify: i64,
}

impl Counters {
    fn from_request(request: &SyncRequest) -> Self {
        Self {
            files_to_transfer: request.files_to_transfer as i64,
            bytes_to_transfer: request.bytes_to_transfer as i64,
            files_to_verify: request.files_to_verify as i64,
            bytes_to_verify: request.bytes_to_verify as i64,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// A verified file whose size on disk differs from the verified size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeMismatch {
    pub name: PathBuf,
    pub line_number: usize,
    pub expected: u64,
    /// `None` when the file is missing
    pub actual: Option<u64>,
}

/// Outstanding work of an open epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remaining {
    pub counters: Counters,
    pub outstanding: Vec<FileRef>,
}

/// Outcome of a reconciliation pass that found no inconsistency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The open epoch was fully verified and `SYNC_DONE` has been appended.
    Completed,
    /// Every epoch in the log was already closed.
    AlreadyDone,
    /// The open epoch still has work; nothing was appended.
    WorkRemaining(Remaining),
}

#[derive(Debug)]
struct Epoch {
    start_line: usize,
    request: SyncRequest,
    counters: Counters,
}

/// Single forward pass over a sync log.
#[derive(Debug, Default)]
pub struct Reconciler {
    disk_root: Option<PathBuf>,
    epoch: Option<Epoch>,
    epochs_seen: usize,
    outstanding: BTreeMap<PathBuf, u64>,
    transfer_files: BTreeSet<PathBuf>,
    verified: HashMap<PathBuf, u64>,
    mismatches: BTreeMap<PathBuf, SizeMismatch>,
}

impl Reconciler {
    /// Replay without looking at the file system.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay and compare every verified file against its size under `root`.
    pub fn with_disk_probe(root: impl Into<PathBuf>) -> Self {
        Self {
            disk_root: Some(root.into()),
            ..Self::default()
        }
    }

    /// Replay every entry of `log`.
    pub fn replay(mut self, log: &SyncLog) -> Result<Self> {
        for item in log.entries()? {
            let (entry, line_number) = item?;
            self.feed(entry, line_number)?;
        }
        Ok(self)
    }

    /// Apply one log entry.
    pub fn feed(&mut self, entry: ManifestEntry, line_number: usize) -> Result<()> {
        match entry {
            ManifestEntry::SyncRequest(request) => self.open_epoch(request, line_number),
            ManifestEntry::TransferRequest(request) => {
                self.request(request.file, true, line_number)
            }
            ManifestEntry::VerifyRequest(request) => self.request(request.file, false, line_number),
            ManifestEntry::TransferVerified(verified) => self.transfer_verified(verified, line_number),
            ManifestEntry::SyncDone(_) => self.close_epoch(line_number),
            other => Err(TransferError::InconsistentManifest(format!(
                "Unexpected {} entry at line {} of the sync log",
                other.tag(),
                line_number
            ))),
        }
    }

    fn open_epoch(&mut self, request: SyncRequest, line_number: usize) -> Result<()> {
        if let Some(epoch) = &self.epoch {
            return Err(TransferError::InconsistentManifest(format!(
                "Sync request at line {} while the sync started at line {} is still open",
                line_number, epoch.start_line
            )));
        }

        self.epochs_seen += 1;
        self.epoch = Some(Epoch {
            start_line: line_number,
            counters: Counters::from_request(&request),
            request,
        });
        Ok(())
    }

    fn request(&mut self, file: FileRef, transfer: bool, line_number: usize) -> Result<()> {
        if self.epoch.is_none() {
            return Err(TransferError::InconsistentManifest(format!(
                "Transfer request found at line {} before sync started",
                line_number
            )));
        }

        if self.verified.get(&file.name) == Some(&file.size) {
            return Ok(());
        }

        if transfer {
            self.transfer_files.insert(file.name.clone());
        }
        self.outstanding.insert(file.name, file.size);
        Ok(())
    }

    fn transfer_verified(&mut self, verified: TransferVerified, line_number: usize) -> Result<()> {
        let Some(epoch) = self.epoch.as_mut() else {
            return Err(TransferError::InconsistentManifest(format!(
                "Transfer verification found at line {} before sync started",
                line_number
            )));
        };

        let FileRef { name, size } = verified.file;
        if self.verified.get(&name) == Some(&size) {
            return Ok(());
        }

        match self.outstanding.get(&name) {
            None => {
                return Err(TransferError::InconsistentManifest(format!(
                    "File {} verified at line {} but was not requested",
                    name.display(),
                    line_number
                )));
            }
            Some(&expected) if expected != size => {
                return Err(TransferError::InconsistentManifest(format!(
                    "Verified file size {} of {} is different than anticipated {}",
                    size,
                    name.display(),
                    expected
                )));
            }
            Some(_) => {}
        }

        if let Some(root) = &self.disk_root {
            match size_on_disk(&root.join(&name))? {
                Some(actual) if actual == size => {
                    self.mismatches.remove(&name);
                }
                actual => {
                    self.mismatches.insert(
                        name.clone(),
                        SizeMismatch {
                            name: name.clone(),
                            line_number,
                            expected: size,
                            actual,
                        },
                    );
                }
            }
        }

        if self.transfer_files.remove(&name) {
            epoch.counters.files_to_transfer -= 1;
            epoch.counters.bytes_to_transfer -= size as i64;
        } else {
            epoch.counters.files_to_verify -= 1;
            epoch.counters.bytes_to_verify -= size as i64;
        }

        self.outstanding.remove(&name);
        self.verified.insert(name, size);
        Ok(())
    }

    fn close_epoch(&mut self, line_number: usize) -> Result<()> {
        let Some(epoch) = &self.epoch else {
            return Err(TransferError::InconsistentManifest(format!(
                "Sync done found at line {} before sync started",
                line_number
            )));
        };

        if !epoch.counters.is_zero() || !self.outstanding.is_empty() {
            return Err(TransferError::InconsistentManifest(format!(
                "SYNC_DONE at line {} but there is work remaining: {:?}, {} files outstanding",
                line_number,
                epoch.counters,
                self.outstanding.len()
            )));
        }

        self.epoch = None;
        self.outstanding.clear();
        self.transfer_files.clear();
        self.verified.clear();
        Ok(())
    }

    /// The `SYNC_REQUEST` of the open epoch, if any.
    pub fn open_request(&self) -> Option<&SyncRequest> {
        self.epoch.as_ref().map(|epoch| &epoch.request)
    }

    pub fn epochs_seen(&self) -> usize {
        self.epochs_seen
    }

    /// Counters of the open epoch.
    pub fn counters(&self) -> Option<Counters> {
        self.epoch.as_ref().map(|epoch| epoch.counters)
    }

    /// Outstanding files of the open epoch, sorted by path, each flagged
    /// with whether it was requested for transfer.
    pub fn outstanding(&self) -> impl Iterator<Item = (FileRef, bool)> + '_ {
        self.outstanding.iter().map(|(name, &size)| {
            (FileRef::new(name, size), self.transfer_files.contains(name))
        })
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn mismatches(&self) -> impl Iterator<Item = &SizeMismatch> {
        self.mismatches.values()
    }

    /// Work left in the open epoch, or `None` if there is no open epoch or
    /// it is fully reconciled.
    pub fn remaining(&self) -> Option<Remaining> {
        let epoch = self.epoch.as_ref()?;
        if epoch.counters.is_zero() && self.outstanding.is_empty() {
            return None;
        }

        Some(Remaining {
            counters: epoch.counters,
            outstanding: self.outstanding().map(|(file, _)| file).collect(),
        })
    }
}

fn size_on_disk(path: &Path) -> Result<Option<u64>> {
    match fs::metadata(path) {
        Ok(metadata) => Ok(Some(metadata.len())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Replay `log`, checking verified sizes on disk under the log's directory,
/// and append `SYNC_DONE` if the open epoch is complete.
pub fn reconcile(log: &SyncLog) -> Result<Verdict> {
    info!("Reconciling {}", log.path().display());

    let reconciler = Reconciler::with_disk_probe(log.dir()).replay(log)?;

    let mismatches: Vec<&SizeMismatch> = reconciler.mismatches().collect();
    if !mismatches.is_empty() {
        for mismatch in &mismatches {
            error!(
                "- Mismatched file size for {} (line {}): expected {}, got {} on disk",
                mismatch.name.display(),
                mismatch.line_number,
                mismatch.expected,
                mismatch
                    .actual
                    .map_or_else(|| "no file".to_string(), |size| size.to_string())
            );
        }
        return Err(TransferError::InconsistentManifest(format!(
            "Local sizes of {} files did not match anticipated sizes: {}",
            mismatches.len(),
            mismatches
                .iter()
                .map(|m| m.name.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    if let Some(remaining) = reconciler.remaining() {
        warn!("Sync not done! Work remaining.");
        warn!(
            "- Files to transfer: {} (bytes {})",
            remaining.counters.files_to_transfer, remaining.counters.bytes_to_transfer
        );
        warn!(
            "- Files to verify: {} (bytes {})",
            remaining.counters.files_to_verify, remaining.counters.bytes_to_verify
        );
        for file in &remaining.outstanding {
            warn!("- Outstanding: {} ({} bytes)", file.name.display(), file.size);
        }
        return Ok(Verdict::WorkRemaining(remaining));
    }

    if reconciler.open_request().is_some() {
        log.append_one(SyncDone::now())?;
        info!("Synchronization done; verification complete");
        return Ok(Verdict::Completed);
    }

    if reconciler.epochs_seen() > 0 {
        info!("All synchronizations done; verification complete");
        return Ok(Verdict::AlreadyDone);
    }

    Err(TransferError::InconsistentManifest(format!(
        "No sync request found in {}",
        log.path().display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Direction, TransferRequest, VerifyRequest};
    use tempfile::TempDir;

    fn sync_request(files_to_transfer: u64, bytes_to_transfer: u64, files_to_verify: u64, bytes_to_verify: u64) -> ManifestEntry {
        SyncRequest {
            direction: Direction::Pull,
            remote_prefix: PathBuf::from("/remote"),
            files_at_source: files_to_transfer + files_to_verify,
            files_to_transfer,
            bytes_to_transfer,
            files_to_verify,
            bytes_to_verify,
            timestamp: 1.0,
        }
        .into()
    }

    fn verified(name: &str, size: u64) -> ManifestEntry {
        TransferVerified::new(name, size, "digest", 2.0).into()
    }

    fn setup() -> Result<(TempDir, SyncLog)> {
        let dir = TempDir::new()?;
        let log = SyncLog::new(dir.path().join("transfer_manifest.txt"));
        log.ensure_exists()?;
        Ok((dir, log))
    }

    fn last_entry(log: &SyncLog) -> Result<ManifestEntry> {
        let entries: Vec<_> = log.entries()?.collect::<Result<_>>()?;
        Ok(entries.last().map(|(e, _)| e.clone()).unwrap())
    }

    #[test]
    fn test_completed_epoch_appends_sync_done() -> Result<()> {
        let (dir, log) = setup()?;
        fs::write(dir.path().join("a"), vec![0u8; 100])?;
        fs::write(dir.path().join("b"), vec![0u8; 200])?;

        log.append(&[
            sync_request(2, 300, 0, 0),
            TransferRequest::new("a", 100).into(),
            TransferRequest::new("b", 200).into(),
            verified("a", 100),
            verified("b", 200),
        ])?;

        assert_eq!(reconcile(&log)?, Verdict::Completed);
        assert!(matches!(last_entry(&log)?, ManifestEntry::SyncDone(_)));

        // A second pass finds nothing left to do and appends nothing.
        let count = log.entries()?.count();
        assert_eq!(reconcile(&log)?, Verdict::AlreadyDone);
        assert_eq!(log.entries()?.count(), count);
        Ok(())
    }

    #[test]
    fn test_unrequested_verification_is_inconsistent() -> Result<()> {
        let (dir, log) = setup()?;
        fs::write(dir.path().join("c"), vec![0u8; 50])?;
        log.append(&[sync_request(0, 0, 0, 0), verified("c", 50)])?;

        match reconcile(&log) {
            Err(TransferError::InconsistentManifest(msg)) => {
                assert!(msg.contains("was not requested"), "{msg}")
            }
            other => panic!("expected an inconsistency, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_open_epoch_reports_remaining_work() -> Result<()> {
        let (_dir, log) = setup()?;
        log.append(&[sync_request(1, 100, 0, 0), TransferRequest::new("a", 100).into()])?;
        let before = log.entries()?.count();

        let Verdict::WorkRemaining(remaining) = reconcile(&log)? else {
            panic!("expected remaining work");
        };
        assert_eq!(remaining.counters.files_to_transfer, 1);
        assert_eq!(remaining.counters.bytes_to_transfer, 100);
        assert_eq!(remaining.outstanding, vec![FileRef::new("a", 100)]);
        assert_eq!(log.entries()?.count(), before);
        Ok(())
    }

    #[test]
    fn test_size_on_disk_mismatch_is_inconsistent() -> Result<()> {
        let (dir, log) = setup()?;
        fs::write(dir.path().join("a"), vec![0u8; 99])?;
        log.append(&[sync_request(1, 100, 0, 0), TransferRequest::new("a", 100).into(), verified("a", 100)])?;

        match reconcile(&log) {
            Err(TransferError::InconsistentManifest(msg)) => assert!(msg.contains('a'), "{msg}"),
            other => panic!("expected an inconsistency, got {:?}", other),
        }

        let reconciler = Reconciler::with_disk_probe(dir.path()).replay(&log)?;
        let mismatches: Vec<_> = reconciler.mismatches().cloned().collect();
        assert_eq!(
            mismatches,
            vec![SizeMismatch {
                name: PathBuf::from("a"),
                line_number: 3,
                expected: 100,
                actual: Some(99),
            }]
        );
        Ok(())
    }

    #[test]
    fn test_missing_file_is_a_mismatch() -> Result<()> {
        let (dir, log) = setup()?;
        log.append(&[sync_request(0, 0, 1, 10), VerifyRequest::new("gone", 10).into(), verified("gone", 10)])?;

        let reconciler = Reconciler::with_disk_probe(dir.path()).replay(&log)?;
        assert_eq!(reconciler.mismatches().next().map(|m| m.actual), Some(None));
        Ok(())
    }

    #[test]
    fn test_later_matching_verification_clears_mismatch() -> Result<()> {
        let (dir, log) = setup()?;
        log.append(&[
            sync_request(1, 10, 0, 0),
            TransferRequest::new("a", 10).into(),
            verified("a", 10),
            SyncDone { timestamp: 3.0 }.into(),
        ])?;
        fs::write(dir.path().join("a"), vec![0u8; 10])?;
        log.append(&[
            sync_request(1, 10, 0, 0),
            TransferRequest::new("a", 10).into(),
            verified("a", 10),
        ])?;

        assert_eq!(reconcile(&log)?, Verdict::Completed);
        Ok(())
    }

    #[test]
    fn test_counters_track_outstanding_after_request_block() -> Result<()> {
        let mut reconciler = Reconciler::new();
        reconciler.feed(sync_request(2, 30, 1, 5), 1)?;
        reconciler.feed(TransferRequest::new("a", 10).into(), 2)?;
        reconciler.feed(TransferRequest::new("b", 20).into(), 3)?;
        reconciler.feed(VerifyRequest::new("c", 5).into(), 4)?;

        let counters = reconciler.counters().unwrap();
        assert_eq!(
            (counters.files_to_transfer + counters.files_to_verify) as usize,
            reconciler.outstanding_len()
        );
        let outstanding_bytes: u64 = reconciler.outstanding().map(|(f, _)| f.size).sum();
        assert_eq!((counters.bytes_to_transfer + counters.bytes_to_verify) as u64, outstanding_bytes);

        reconciler.feed(verified("b", 20), 5)?;
        let counters = reconciler.counters().unwrap();
        assert_eq!(counters.files_to_transfer, 1);
        assert_eq!(counters.bytes_to_transfer, 10);
        assert_eq!(
            reconciler.outstanding().collect::<Vec<_>>(),
            vec![(FileRef::new("a", 10), true), (FileRef::new("c", 5), false)]
        );
        Ok(())
    }

    #[test]
    fn test_duplicate_verification_is_a_no_op() -> Result<()> {
        let mut reconciler = Reconciler::new();
        reconciler.feed(sync_request(1, 10, 0, 0), 1)?;
        reconciler.feed(TransferRequest::new("a", 10).into(), 2)?;
        reconciler.feed(verified("a", 10), 3)?;
        reconciler.feed(verified("a", 10), 4)?;

        assert_eq!(reconciler.counters(), Some(Counters::default()));
        assert!(reconciler.remaining().is_none());
        Ok(())
    }

    #[test]
    fn test_nested_sync_request_is_inconsistent() -> Result<()> {
        let mut reconciler = Reconciler::new();
        reconciler.feed(sync_request(0, 0, 0, 0), 1)?;
        assert!(matches!(
            reconciler.feed(sync_request(0, 0, 0, 0), 2),
            Err(TransferError::InconsistentManifest(_))
        ));
        Ok(())
    }

    #[test]
    fn test_premature_sync_done_is_inconsistent() -> Result<()> {
        let mut reconciler = Reconciler::new();
        reconciler.feed(sync_request(1, 10, 0, 0), 1)?;
        reconciler.feed(TransferRequest::new("a", 10).into(), 2)?;
        assert!(matches!(
            reconciler.feed(SyncDone { timestamp: 1.0 }.into(), 3),
            Err(TransferError::InconsistentManifest(_))
        ));
        Ok(())
    }

    #[test]
    fn test_entries_outside_epoch_are_inconsistent() {
        for entry in [
            TransferRequest::new("a", 1).into(),
            VerifyRequest::new("a", 1).into(),
            verified("a", 1),
            SyncDone { timestamp: 1.0 }.into(),
        ] {
            assert!(matches!(
                Reconciler::new().feed(entry, 1),
                Err(TransferError::InconsistentManifest(_))
            ));
        }
    }

    #[test]
    fn test_verified_size_must_match_request() -> Result<()> {
        let mut reconciler = Reconciler::new();
        reconciler.feed(sync_request(1, 10, 0, 0), 1)?;
        reconciler.feed(TransferRequest::new("a", 10).into(), 2)?;

        match reconciler.feed(verified("a", 11), 3) {
            Err(TransferError::InconsistentManifest(msg)) => {
                assert!(msg.contains("different than anticipated"), "{msg}")
            }
            other => panic!("expected an inconsistency, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_log_without_epoch_is_inconsistent() -> Result<()> {
        let (_dir, log) = setup()?;
        assert!(matches!(reconcile(&log), Err(TransferError::InconsistentManifest(_))));
        Ok(())
    }
}
