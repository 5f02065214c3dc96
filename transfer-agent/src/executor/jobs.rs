//! Job specs handed to the external dispatcher.
//!
//! Each work item becomes one job: a worker command run on the remote side,
//! the files staged in and out of its scratch directory, and a post hook
//! that verifies the result locally.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use super::work_items::WorkItem;
use crate::config::FilesConfig;
use crate::manifest::Direction;
use crate::utils::errors::{Result, TransferError};

/// Layer of the verify-only jobs.
pub const VERIFY_LAYER: &str = "verify";

/// One dispatchable job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Node name, `layer:index`
    pub name: String,

    /// Worker subcommand and its arguments
    pub command: String,
    pub arguments: Vec<String>,

    /// Local files staged into the scratch directory
    pub input_files: Vec<PathBuf>,

    /// Scratch file name → local destination
    pub output_files: BTreeMap<String, PathBuf>,

    pub stdout: PathBuf,
    pub stderr: PathBuf,

    /// Command run locally after the job succeeds
    pub post: Vec<String>,
}

impl JobSpec {
    /// Job copying one file in `direction`.
    pub fn transfer(
        direction: Direction,
        index: usize,
        item: &WorkItem,
        working_dir: &Path,
        files: &FilesConfig,
    ) -> Self {
        let name = format!("{}:{}", direction, index);
        let mut output_files = BTreeMap::new();
        output_files.insert(files.metadata_file.clone(), item.metadata_path(working_dir));

        let (command, input_files) = match direction {
            Direction::Pull => {
                output_files.insert(files.sandbox_file.clone(), item.local_file.clone());
                ("pull-file", Vec::new())
            }
            Direction::Push => ("push-file", vec![item.local_file.clone()]),
        };

        Self {
            post: post_hook(&working_dir.join(&files.transfer_commands), &name),
            name,
            command: command.to_string(),
            arguments: vec![item.remote_file.to_string_lossy().into_owned()],
            input_files,
            output_files,
            stdout: item.stdout_path(working_dir),
            stderr: item.stderr_path(working_dir),
        }
    }

    /// Job hashing one remote file in place.
    pub fn verify(index: usize, item: &WorkItem, working_dir: &Path, files: &FilesConfig) -> Self {
        let name = format!("{}:{}", VERIFY_LAYER, index);
        let mut output_files = BTreeMap::new();
        output_files.insert(files.metadata_file.clone(), item.metadata_path(working_dir));

        Self {
            post: post_hook(&working_dir.join(&files.verify_commands), &name),
            name,
            command: "get-remote-metadata".to_string(),
            arguments: vec![item.remote_file.to_string_lossy().into_owned()],
            input_files: Vec::new(),
            output_files,
            stdout: item.stdout_path(working_dir),
            stderr: item.stderr_path(working_dir),
        }
    }
}

fn post_hook(descriptor_file: &Path, node_name: &str) -> Vec<String> {
    vec![
        "verify-metadata".to_string(),
        "--cmd-info".to_string(),
        descriptor_file.to_string_lossy().into_owned(),
        "--key".to_string(),
        node_name.to_string(),
    ]
}

/// All jobs of one planning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobBatch {
    /// Tag carried by every job so a second sync of the same data can be
    /// refused while this one runs
    pub unique_id: Option<String>,

    /// Limit on concurrent transfer jobs (test mode runs them one at a time)
    pub max_transfer_jobs: Option<usize>,

    pub transfer_jobs: Vec<JobSpec>,
    pub verify_jobs: Vec<JobSpec>,
}

impl JobBatch {
    pub fn len(&self) -> usize {
        self.transfer_jobs.len() + self.verify_jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Something that accepts jobs for execution.
pub trait Dispatcher {
    fn submit(&mut self, batch: &JobBatch) -> Result<()>;
}

/// Dispatcher that writes the batch as JSON for an external scheduler to
/// pick up.
#[derive(Debug, Clone)]
pub struct JobFile {
    path: PathBuf,
}

impl JobFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Dispatcher for JobFile {
    fn submit(&mut self, batch: &JobBatch) -> Result<()> {
        let mut file = File::create(&self.path)?;
        serde_json::to_writer_pretty(&mut file, batch)?;
        file.write_all(b"\n")?;
        file.sync_all()?;

        info!(
            "Wrote {} transfer and {} verify jobs to {}",
            batch.transfer_jobs.len(),
            batch.verify_jobs.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// View of the scheduler's queue.
pub trait JobQueue {
    /// Number of jobs tagged with `unique_id` that have not finished.
    fn active_jobs(&self, unique_id: &str) -> Result<usize>;
}

/// Refuse to start a sync while jobs with the same unique id are queued.
pub fn check_already_running(queue: &dyn JobQueue, unique_id: Option<&str>) -> Result<()> {
    let Some(unique_id) = unique_id.filter(|id| !id.is_empty()) else {
        return Ok(());
    };

    if queue.active_jobs(unique_id)? > 0 {
        return Err(TransferError::TransferAlreadyRunning(format!(
            "Jobs already found in queue with unique id {:?}",
            unique_id
        )));
    }
    Ok(())
}
