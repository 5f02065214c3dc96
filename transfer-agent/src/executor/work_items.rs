//! Work-item descriptor files.
//!
//! The planner writes one JSON object per kind of work item, keyed by item
//! index. The verification step looks its item up again by the dispatcher's
//! node name.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::sync::diff::flatten_path;
use crate::utils::errors::{Result, TransferError};

/// Everything the dispatcher and the verification step need to know about
/// one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub remote_file: PathBuf,
    pub local_file: PathBuf,
    pub local_prefix: PathBuf,
    pub flattened_name: String,
    pub transfer_manifest: PathBuf,
}

impl WorkItem {
    pub fn new(relative: &Path, remote_prefix: &Path, local_prefix: &Path, transfer_manifest: &Path) -> Self {
        Self {
            remote_file: remote_prefix.join(relative),
            local_file: local_prefix.join(relative),
            local_prefix: local_prefix.to_path_buf(),
            flattened_name: flatten_path(relative),
            transfer_manifest: transfer_manifest.to_path_buf(),
        }
    }

    /// Where the worker's metadata file is staged back to.
    pub fn metadata_path(&self, working_dir: &Path) -> PathBuf {
        working_dir.join(format!("{}.metadata", self.flattened_name))
    }

    /// Captured stdout of the worker.
    pub fn stdout_path(&self, working_dir: &Path) -> PathBuf {
        working_dir.join(format!("{}.out", self.flattened_name))
    }

    /// Captured stderr of the worker.
    pub fn stderr_path(&self, working_dir: &Path) -> PathBuf {
        working_dir.join(format!("{}.err", self.flattened_name))
    }
}

/// Strip a dispatcher node name such as `pull:12` down to the item key.
pub fn item_key(node_name: &str) -> &str {
    node_name.rsplit(':').next().unwrap_or(node_name)
}

/// Write `items` to `path` as a JSON object keyed by index.
pub fn write_work_items(path: &Path, items: &[WorkItem]) -> Result<()> {
    let keyed: BTreeMap<String, &WorkItem> = items
        .iter()
        .enumerate()
        .map(|(index, item)| (index.to_string(), item))
        .collect();

    let mut file = File::create(path)?;
    serde_json::to_writer_pretty(&mut file, &keyed)?;
    file.write_all(b"\n")?;
    file.sync_all()?;

    info!("Wrote {} work items to {}", items.len(), path.display());
    Ok(())
}

/// Look up one work item in a descriptor file.
pub fn load_work_item(path: &Path, node_name: &str) -> Result<WorkItem> {
    let content = fs::read_to_string(path)?;
    let mut items: BTreeMap<String, WorkItem> = serde_json::from_str(&content)?;

    let key = item_key(node_name);
    items.remove(key).ok_or_else(|| {
        TransferError::NotAWorkItem(format!("No work item {:?} in {}", key, path.display()))
    })
}
