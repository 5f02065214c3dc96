//! Diff of a source inventory against a destination inventory and the
//! verification history recorded in the sync log.

use std::path::Path;
use tracing::{debug, info};

use crate::manifest::inventory::Inventory;
use crate::manifest::log::SyncLog;
use crate::manifest::{FileRef, ManifestEntry};
use crate::utils::errors::Result;

/// Work implied by one source/destination comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncDiff {
    /// Files whose destination size differs from the source (or that are
    /// missing at the destination), sorted by path
    pub to_transfer: Vec<FileRef>,

    /// Files that look identical by size but have never been verified,
    /// sorted by path
    pub to_verify: Vec<FileRef>,

    pub bytes_to_transfer: u64,
    pub bytes_to_verify: u64,
}

impl SyncDiff {
    pub fn is_empty(&self) -> bool {
        self.to_transfer.is_empty() && self.to_verify.is_empty()
    }
}

/// Compare `source` against `destination`.
///
/// `verified` maps each path to the size recorded by its most recent
/// verification. A path whose recorded size matches the source is skipped
/// unless its destination size differs.
pub fn compute_diff(source: &Inventory, destination: &Inventory, verified: &Inventory) -> SyncDiff {
    let mut diff = SyncDiff::default();

    // Inventories are ordered maps, so both lists come out sorted.
    for (path, &size) in source {
        if destination.get(path) != Some(&size) {
            diff.bytes_to_transfer += size;
            diff.to_transfer.push(FileRef::new(path, size));
            continue;
        }

        if verified.get(path) == Some(&size) {
            debug!("{} already verified at {} bytes", path.display(), size);
            continue;
        }

        diff.bytes_to_verify += size;
        diff.to_verify.push(FileRef::new(path, size));
    }

    info!(
        "Diff: {} files ({} bytes) to transfer, {} files ({} bytes) to verify, {} at source",
        diff.to_transfer.len(),
        diff.bytes_to_transfer,
        diff.to_verify.len(),
        diff.bytes_to_verify,
        source.len()
    );
    diff
}

/// Latest verified size of every path ever verified in `log`.
pub fn verified_files(log: &SyncLog) -> Result<Inventory> {
    let mut verified = Inventory::new();
    if !log.path().exists() {
        return Ok(verified);
    }

    for item in log.entries()? {
        let (entry, _) = item?;
        if let ManifestEntry::TransferVerified(entry) = entry {
            verified.insert(entry.file.name, entry.file.size);
        }
    }
    Ok(verified)
}

/// Encode a relative path as a single identifier safe for job names and
/// staged file names.
pub fn flatten_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('/', "_SLASH_")
        .replace(' ', "_SPACE_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{TransferVerified, VerifyRequest};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn inventory(files: &[(&str, u64)]) -> Inventory {
        files.iter().map(|(p, s)| (PathBuf::from(p), *s)).collect()
    }

    #[test]
    fn test_empty_destination_transfers_everything() {
        let source = inventory(&[("b", 200), ("a", 100)]);
        let diff = compute_diff(&source, &Inventory::new(), &Inventory::new());

        assert_eq!(diff.to_transfer, vec![FileRef::new("a", 100), FileRef::new("b", 200)]);
        assert!(diff.to_verify.is_empty());
        assert_eq!(diff.bytes_to_transfer, 300);
        assert_eq!(diff.bytes_to_verify, 0);
    }

    #[test]
    fn test_previously_verified_file_skipped() {
        let source = inventory(&[("a", 100)]);
        let destination = inventory(&[("a", 100)]);
        let verified = inventory(&[("a", 100)]);

        assert!(compute_diff(&source, &destination, &verified).is_empty());
    }

    #[test]
    fn test_unverified_matching_file_is_verified() {
        let source = inventory(&[("a", 100)]);
        let destination = inventory(&[("a", 100)]);

        let diff = compute_diff(&source, &destination, &Inventory::new());
        assert!(diff.to_transfer.is_empty());
        assert_eq!(diff.to_verify, vec![FileRef::new("a", 100)]);
        assert_eq!(diff.bytes_to_verify, 100);
    }

    #[test]
    fn test_size_change_wins_over_history() {
        let source = inventory(&[("a", 150), ("b", 10)]);
        let destination = inventory(&[("a", 100), ("b", 10)]);
        // Verified at a different size than the current source.
        let verified = inventory(&[("a", 100), ("b", 9)]);

        let diff = compute_diff(&source, &destination, &verified);
        assert_eq!(diff.to_transfer, vec![FileRef::new("a", 150)]);
        assert_eq!(diff.to_verify, vec![FileRef::new("b", 10)]);
    }

    #[test]
    fn test_destination_only_files_ignored() {
        let source = inventory(&[("a", 1)]);
        let destination = inventory(&[("a", 1), ("stale", 5)]);

        let diff = compute_diff(&source, &destination, &inventory(&[("a", 1)]));
        assert!(diff.is_empty());
    }

    #[test]
    fn test_diff_is_idempotent_once_applied() {
        let source = inventory(&[("a", 100), ("dir/b", 200), ("c", 0)]);
        let destination = inventory(&[("c", 0)]);

        let first = compute_diff(&source, &destination, &Inventory::new());
        assert_eq!(first.to_transfer.len(), 2);
        assert_eq!(first.to_verify.len(), 1);

        // Apply: everything copied and verified.
        let verified = source.clone();
        let second = compute_diff(&source, &source, &verified);
        assert!(second.is_empty());
        assert_eq!(compute_diff(&source, &source, &verified), second);
    }

    #[test]
    fn test_verified_files_keeps_latest_size() -> Result<()> {
        let dir = TempDir::new()?;
        let log = SyncLog::new(dir.path().join("transfer_manifest.txt"));
        assert!(verified_files(&log)?.is_empty());

        log.append(&[
            TransferVerified::new("a", 1, "d1", 1.0).into(),
            VerifyRequest::new("b", 2).into(),
            TransferVerified::new("a", 5, "d2", 2.0).into(),
        ])?;

        assert_eq!(verified_files(&log)?, inventory(&[("a", 5)]));
        Ok(())
    }

    #[test]
    fn test_flatten_path() {
        assert_eq!(flatten_path(Path::new("dir/sub dir/a b.txt")), "dir_SLASH_sub_SPACE_dir_SLASH_a_SPACE_b.txt");
        assert_eq!(flatten_path(Path::new("plain")), "plain");
    }
}
