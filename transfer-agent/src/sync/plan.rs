//! Planning a synchronization: inventories in, work items and an open epoch
//! out.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::diff::{compute_diff, verified_files, SyncDiff};
use super::reconcile::Reconciler;
use crate::config::Config;
use crate::executor::jobs::{check_already_running, Dispatcher, JobBatch, JobQueue, JobSpec};
use crate::executor::work_items::{write_work_items, WorkItem};
use crate::fs::walker::ScanOptions;
use crate::manifest::inventory::{read_inventory, write_inventory};
use crate::manifest::log::SyncLog;
use crate::manifest::{timestamp, Direction, FileRef, ManifestEntry, SyncRequest, TransferRequest, VerifyRequest};
use crate::utils::errors::{Result, TransferError};

/// Inputs of one planning pass.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub direction: Direction,
    pub remote_prefix: PathBuf,
    /// Inventory of the remote side, as written by `make-file-manifest`
    pub remote_manifest: PathBuf,
    pub local_prefix: PathBuf,
    /// Directory receiving the local inventory, descriptors and job specs
    pub working_dir: PathBuf,
    pub test_mode: bool,
    pub unique_id: Option<String>,
}

/// Result of a planning pass.
#[derive(Debug, Clone)]
pub struct Plan {
    pub transfer_items: Vec<WorkItem>,
    pub verify_items: Vec<WorkItem>,
    /// `true` when an already open epoch was picked up instead of a new one
    pub resumed: bool,
    pub log: SyncLog,
}

/// Compute the work of a sync, open an epoch for it in the sync log and hand
/// the jobs to `dispatcher`.
///
/// If the sync log already has an open epoch nothing is appended; the work
/// items are rebuilt from that epoch's outstanding files.
pub fn plan_sync(
    request: &PlanRequest,
    config: &Config,
    dispatcher: &mut dyn Dispatcher,
    queue: Option<&dyn JobQueue>,
) -> Result<Plan> {
    info!(
        "Planning {} of {} -> {}",
        request.direction,
        request.remote_prefix.display(),
        request.local_prefix.display()
    );

    if let Some(queue) = queue {
        check_already_running(queue, request.unique_id.as_deref())?;
    }

    let files = &config.files;
    fs::create_dir_all(&request.working_dir)?;

    info!("Parsing remote file manifest...");
    let remote_files = read_inventory(&request.remote_prefix, &request.remote_manifest)?;

    info!("Generating local file manifest...");
    let local_manifest = request.working_dir.join(&files.local_manifest);
    write_inventory(&request.local_prefix, &local_manifest, ScanOptions::default())?;
    let mut local_files = read_inventory(&request.local_prefix, &local_manifest)?;

    let log = SyncLog::new(request.local_prefix.join(&files.transfer_manifest));
    log.ensure_exists()?;

    // The sync log is never transferred.
    local_files.remove(Path::new(&files.transfer_manifest));

    let replay = Reconciler::new().replay(&log)?;
    let (to_transfer, to_verify, resumed) = match replay.open_request() {
        Some(open) => {
            check_same_sync(open, request)?;
            let (transfer, verify): (Vec<_>, Vec<_>) = replay.outstanding().partition(|(_, t)| *t);
            info!(
                "Resuming open sync: {} files to transfer, {} files to verify",
                transfer.len(),
                verify.len()
            );
            (
                transfer.into_iter().map(|(f, _)| f).collect::<Vec<_>>(),
                verify.into_iter().map(|(f, _)| f).collect::<Vec<_>>(),
                true,
            )
        }
        None => {
            let (source, destination) = match request.direction {
                Direction::Pull => (&remote_files, &local_files),
                Direction::Push => (&local_files, &remote_files),
            };
            let diff = compute_diff(source, destination, &verified_files(&log)?);
            log.append(&epoch_entries(request, source.len(), &diff))?;
            (diff.to_transfer, diff.to_verify, false)
        }
    };

    if request.direction == Direction::Pull {
        ensure_local_dirs_exist(&request.local_prefix, to_transfer.iter().map(|f| f.name.as_path()))?;
    }

    let make_items = |files: &[FileRef]| -> Vec<WorkItem> {
        files
            .iter()
            .map(|f| WorkItem::new(&f.name, &request.remote_prefix, &request.local_prefix, log.path()))
            .collect()
    };
    let transfer_items = make_items(&to_transfer);
    let verify_items = make_items(&to_verify);

    write_work_items(&request.working_dir.join(&files.transfer_commands), &transfer_items)?;
    write_work_items(&request.working_dir.join(&files.verify_commands), &verify_items)?;

    let batch = JobBatch {
        unique_id: request.unique_id.clone(),
        max_transfer_jobs: request.test_mode.then_some(1),
        transfer_jobs: transfer_items
            .iter()
            .enumerate()
            .map(|(i, item)| JobSpec::transfer(request.direction, i, item, &request.working_dir, files))
            .collect(),
        verify_jobs: verify_items
            .iter()
            .enumerate()
            .map(|(i, item)| JobSpec::verify(i, item, &request.working_dir, files))
            .collect(),
    };
    if batch.is_empty() {
        info!("No jobs to dispatch; run finalize to close the sync");
    } else {
        info!("Dispatching {} jobs", batch.len());
    }
    dispatcher.submit(&batch)?;

    Ok(Plan {
        transfer_items,
        verify_items,
        resumed,
        log,
    })
}

/// `SYNC_REQUEST` followed by the sorted transfer and verify requests.
fn epoch_entries(request: &PlanRequest, files_at_source: usize, diff: &SyncDiff) -> Vec<ManifestEntry> {
    let mut entries = Vec::with_capacity(1 + diff.to_transfer.len() + diff.to_verify.len());
    entries.push(
        SyncRequest {
            direction: request.direction,
            remote_prefix: request.remote_prefix.clone(),
            files_at_source: files_at_source as u64,
            files_to_transfer: diff.to_transfer.len() as u64,
            bytes_to_transfer: diff.bytes_to_transfer,
            files_to_verify: diff.to_verify.len() as u64,
            bytes_to_verify: diff.bytes_to_verify,
            timestamp: timestamp(),
        }
        .into(),
    );
    entries.extend(
        diff.to_transfer
            .iter()
            .map(|f| TransferRequest::new(&f.name, f.size).into()),
    );
    entries.extend(diff.to_verify.iter().map(|f| VerifyRequest::new(&f.name, f.size).into()));
    entries
}

fn check_same_sync(open: &SyncRequest, request: &PlanRequest) -> Result<()> {
    if open.direction != request.direction || open.remote_prefix != request.remote_prefix {
        return Err(TransferError::InconsistentManifest(format!(
            "An unfinished {} sync with {} is open; finalize it before starting a {} sync with {}",
            open.direction,
            open.remote_prefix.display(),
            request.direction,
            request.remote_prefix.display()
        )));
    }
    warn!(
        "Sync log already has an open {} sync started at {}; resuming it",
        open.direction, open.timestamp
    );
    Ok(())
}

/// Create the parent directory of every `prefix/relative` path.
pub fn ensure_local_dirs_exist<'a, I>(prefix: &Path, relative_paths: I) -> Result<()>
where
    I: IntoIterator<Item = &'a Path>,
{
    let dirs: BTreeSet<PathBuf> = relative_paths
        .into_iter()
        .filter_map(|p| prefix.join(p).parent().map(Path::to_path_buf))
        .collect();

    for dir in dirs {
        fs::create_dir_all(&dir)?;
    }
    Ok(())
}
