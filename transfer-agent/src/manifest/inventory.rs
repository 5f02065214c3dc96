//! File inventories: `FILE`-only manifests describing one side of a sync.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use super::log::ManifestReader;
use super::{FileEntry, ManifestEntry};
use crate::fs::walker::{scan, ScanOptions};
use crate::utils::errors::Result;

/// Relative path → size in bytes, ordered by path.
pub type Inventory = BTreeMap<PathBuf, u64>;

/// Scan `root` and write one `FILE` entry per regular file to `manifest_path`.
///
/// The manifest is always created, even when `root` does not exist.
/// Returns the number of entries written.
pub fn write_inventory(root: &Path, manifest_path: &Path, options: ScanOptions) -> Result<usize> {
    info!("Generating file listing for {}", root.display());

    let mut out = BufWriter::new(File::create(manifest_path)?);
    let mut count = 0usize;
    let mut total_bytes = 0u64;

    for file in scan(root, options) {
        let file = file?;
        total_bytes += file.size;
        let entry = ManifestEntry::from(FileEntry::new(file.path, file.size));
        out.write_all(entry.to_line()?.as_bytes())?;
        count += 1;
    }

    let file = out.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    info!(
        "Listed {} files ({} bytes) under {} into {}",
        count,
        total_bytes,
        root.display(),
        manifest_path.display()
    );
    Ok(count)
}

/// Read an inventory manifest into a mapping relative to `prefix`.
///
/// Entries outside `prefix` are logged and skipped; an entry naming the
/// prefix itself is dropped with a warning.
pub fn read_inventory(prefix: &Path, manifest_path: &Path) -> Result<Inventory> {
    let mut files = Inventory::new();

    for item in ManifestReader::open(manifest_path)? {
        let (entry, line_number) = item?;
        let file = entry.expect::<FileEntry>()?.file;

        if file.name == prefix {
            warn!(
                "{}:{}: entry is the prefix {} itself, skipping",
                manifest_path.display(),
                line_number,
                prefix.display()
            );
            continue;
        }

        match file.name.strip_prefix(prefix) {
            Ok(relative) => {
                files.insert(relative.to_path_buf(), file.size);
            }
            Err(_) => {
                error!(
                    "{}:{}: file {} does not start with prefix {}, skipping",
                    manifest_path.display(),
                    line_number,
                    file.name.display(),
                    prefix.display()
                );
            }
        }
    }

    Ok(files)
}
