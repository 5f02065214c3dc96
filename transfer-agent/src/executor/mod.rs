//! Worker commands and the post-job verification step.
//!
//! Worker commands run inside a dispatched job, next to the remote data, and
//! leave their results in the job's scratch directory for the dispatcher to
//! stage back. Verification runs locally once the staged files have landed.

pub mod context;
pub mod jobs;
pub mod work_items;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::Config;
use crate::fs::walker::ScanOptions;
use crate::manifest::inventory::write_inventory;
use crate::manifest::log::{read_metadata_file, write_metadata_file, SyncLog};
use crate::manifest::{timestamp, Metadata, TransferVerified};
use crate::transfer::hash::{copy_with_hash, hash_file, HashOptions, HashResult};
use crate::utils::errors::{Result, TransferError};
use context::ExecutionContext;
use work_items::{load_work_item, WorkItem};

/// Inventory `src` into the scratch directory's remote manifest.
pub fn make_file_manifest(ctx: &ExecutionContext, src: &Path, config: &Config, test_mode: bool) -> Result<PathBuf> {
    ctx.require_work_item()?;

    let options = if test_mode {
        ScanOptions::test_mode(config.sync.test_mode_max_file_size)
    } else {
        ScanOptions::default()
    };

    let manifest_path = ctx.scratch_dir.join(&config.files.remote_manifest);
    write_inventory(src, &manifest_path, options)?;
    Ok(manifest_path)
}

/// Copy a remote file into the scratch sandbox file.
pub fn pull_file(ctx: &ExecutionContext, src: &Path, config: &Config) -> Result<Metadata> {
    ctx.require_work_item()?;

    let sandbox_path = ctx.scratch_dir.join(&config.files.sandbox_file);
    let result = copy_with_hash(src, &sandbox_path, &HashOptions::from(&config.sync))?;
    write_worker_metadata(ctx, src, result, config)
}

/// Copy the staged scratch file named like `dest` onto `dest`.
pub fn push_file(ctx: &ExecutionContext, dest: &Path, config: &Config) -> Result<Metadata> {
    ctx.require_work_item()?;

    let file_name = dest.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", dest.display()),
        )
    })?;
    let sandbox_path = ctx.scratch_dir.join(file_name);

    let result = copy_with_hash(&sandbox_path, dest, &HashOptions::from(&config.sync))?;
    write_worker_metadata(ctx, dest, result, config)
}

/// Hash a remote file in place.
pub fn get_remote_metadata(ctx: &ExecutionContext, src: &Path, config: &Config) -> Result<Metadata> {
    ctx.require_work_item()?;

    let result = hash_file(src, &HashOptions::from(&config.sync))?;
    write_worker_metadata(ctx, src, result, config)
}

fn write_worker_metadata(ctx: &ExecutionContext, name: &Path, result: HashResult, config: &Config) -> Result<Metadata> {
    let metadata = Metadata::new(name, result.byte_count, result.digest);
    write_metadata_file(&ctx.scratch_dir.join(&config.files.metadata_file), metadata.clone())?;
    Ok(metadata)
}

/// Check a staged metadata file against the local copy of its file and
/// record the verification in the sync log.
///
/// On any mismatch nothing is appended. On success the metadata file and the
/// job's captured output are removed.
pub fn verify_metadata(item: &WorkItem, metadata_path: &Path, config: &Config) -> Result<TransferVerified> {
    let remote = read_metadata_file(metadata_path, config.sync.metadata_size_limit)?;

    info!("About to verify contents of {}", item.local_file.display());

    let local_size = fs::metadata(&item.local_file)?.len();
    if local_size != remote.file.size {
        return Err(TransferError::VerificationFailed(format!(
            "Local file size ({} bytes) does not match remote file size ({} bytes)",
            local_size, remote.file.size
        )));
    }

    let local = hash_file(&item.local_file, &HashOptions::from(&config.sync))?;
    if local.digest != remote.digest {
        return Err(TransferError::VerificationFailed(format!(
            "Local file {} has digest of {}, which does not match remote file {} (digest {})",
            item.local_file.display(),
            local.digest,
            remote.file.name.display(),
            remote.digest
        )));
    }

    info!(
        "File verification successful: local file ({}) and remote file ({}) have matching digest ({})",
        item.local_file.display(),
        remote.file.name.display(),
        remote.digest
    );

    let relative = item.local_file.strip_prefix(&item.local_prefix).map_err(|_| {
        TransferError::InvalidManifestEntry(format!(
            "Local file {} is not under the local prefix {}",
            item.local_file.display(),
            item.local_prefix.display()
        ))
    })?;

    let verified = TransferVerified::new(relative, remote.file.size, remote.digest, timestamp());
    SyncLog::new(&item.transfer_manifest).append_one(verified.clone())?;

    for path in [
        metadata_path.to_path_buf(),
        metadata_path.with_extension("out"),
        metadata_path.with_extension("err"),
    ] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(verified)
}

/// Post hook entry point: look the work item up by node name and verify the
/// metadata staged for it in `working_dir`.
pub fn verify_work_item(cmd_info: &Path, key: &str, working_dir: &Path, config: &Config) -> Result<TransferVerified> {
    let item = load_work_item(cmd_info, key)?;
    verify_metadata(&item, &item.metadata_path(working_dir), config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::jobs::JobFile;
    use crate::manifest::{Direction, ManifestEntry};
    use crate::sync::plan::{plan_sync, PlanRequest};
    use crate::sync::reconcile::{reconcile, Verdict};
    use tempfile::TempDir;

    /// Stand-in for the dispatcher: run one job in a fresh scratch directory
    /// and stage its outputs back.
    fn run_job(root: &Path, job: &str, outputs: &[(&str, &Path)], run: impl FnOnce(&ExecutionContext) -> Result<Metadata>) -> Result<()> {
        let scratch = root.join("scratch").join(job.replace(':', "_"));
        fs::create_dir_all(&scratch)?;
        let ctx = ExecutionContext::work_item(&scratch);
        run(&ctx)?;
        for (name, dest) in outputs {
            fs::copy(scratch.join(name), dest)?;
        }
        Ok(())
    }

    #[test]
    fn test_worker_commands_require_work_item() -> Result<()> {
        let dir = TempDir::new()?;
        let ctx = ExecutionContext {
            scratch_dir: dir.path().to_path_buf(),
            job_ad: None,
            host: "submit".to_string(),
        };
        let config = Config::default();

        assert!(matches!(
            pull_file(&ctx, &dir.path().join("x"), &config),
            Err(TransferError::NotAWorkItem(_))
        ));
        assert!(matches!(
            make_file_manifest(&ctx, dir.path(), &config, false),
            Err(TransferError::NotAWorkItem(_))
        ));
        Ok(())
    }

    #[test]
    fn test_pull_file_writes_sandbox_and_metadata() -> Result<()> {
        let dir = TempDir::new()?;
        let src = dir.path().join("remote.txt");
        fs::write(&src, b"abc")?;
        let ctx = ExecutionContext::work_item(dir.path().join("scratch"));
        let config = Config::default();

        let metadata = pull_file(&ctx, &src, &config)?;
        assert_eq!(metadata, Metadata::new(&src, 3, "a9993e364706816aba3e25717850c26c9cd0d89d"));
        assert_eq!(fs::read(ctx.scratch_dir.join("file-for-transfer"))?, b"abc");
        assert_eq!(
            read_metadata_file(&ctx.scratch_dir.join("metadata"), config.sync.metadata_size_limit)?,
            metadata
        );
        Ok(())
    }

    #[test]
    fn test_push_file_copies_staged_file() -> Result<()> {
        let dir = TempDir::new()?;
        let ctx = ExecutionContext::work_item(dir.path().join("scratch"));
        fs::create_dir_all(&ctx.scratch_dir)?;
        fs::write(ctx.scratch_dir.join("data.bin"), b"payload")?;
        let dest = dir.path().join("remote/sub/data.bin");

        let metadata = push_file(&ctx, &dest, &Config::default())?;
        assert_eq!(fs::read(&dest)?, b"payload");
        assert_eq!(metadata.file.size, 7);
        assert!(ctx.scratch_dir.join("metadata").exists());
        Ok(())
    }

    #[test]
    fn test_verification_failure_appends_nothing() -> Result<()> {
        let dir = TempDir::new()?;
        let local_prefix = dir.path().join("local");
        fs::create_dir_all(&local_prefix)?;
        let log = SyncLog::new(local_prefix.join("transfer_manifest.txt"));
        log.ensure_exists()?;
        let item = WorkItem::new(Path::new("a"), Path::new("/remote"), &local_prefix, log.path());
        let config = Config::default();

        fs::write(&item.local_file, b"abd")?;
        let metadata_path = item.metadata_path(dir.path());
        write_metadata_file(&metadata_path, Metadata::new("/remote/a", 3, "a9993e364706816aba3e25717850c26c9cd0d89d"))?;
        assert!(matches!(
            verify_metadata(&item, &metadata_path, &config),
            Err(TransferError::VerificationFailed(_))
        ));

        fs::write(&item.local_file, b"abcd")?;
        assert!(matches!(
            verify_metadata(&item, &metadata_path, &config),
            Err(TransferError::VerificationFailed(_))
        ));

        assert_eq!(log.entries()?.count(), 0);
        assert!(metadata_path.exists());
        Ok(())
    }

    #[test]
    fn test_verify_metadata_appends_and_cleans_up() -> Result<()> {
        let dir = TempDir::new()?;
        let local_prefix = dir.path().join("local");
        fs::create_dir_all(local_prefix.join("d"))?;
        let log = SyncLog::new(local_prefix.join("transfer_manifest.txt"));
        let item = WorkItem::new(Path::new("d/a"), Path::new("/remote"), &local_prefix, log.path());
        fs::write(&item.local_file, b"abc")?;

        let metadata_path = item.metadata_path(dir.path());
        write_metadata_file(&metadata_path, Metadata::new("/remote/d/a", 3, "a9993e364706816aba3e25717850c26c9cd0d89d"))?;
        fs::write(item.stdout_path(dir.path()), b"out")?;
        fs::write(item.stderr_path(dir.path()), b"err")?;

        let verified = verify_metadata(&item, &metadata_path, &Config::default())?;
        assert_eq!(verified.file.name, Path::new("d/a"));

        let entries: Vec<_> = log.entries()?.collect::<Result<_>>()?;
        assert_eq!(entries, vec![(ManifestEntry::from(verified), 1)]);
        assert!(!metadata_path.exists());
        assert!(!item.stdout_path(dir.path()).exists());
        assert!(!item.stderr_path(dir.path()).exists());
        Ok(())
    }

    #[test]
    fn test_pull_sync_end_to_end() -> Result<()> {
        let dir = TempDir::new()?;
        let root = dir.path();
        let remote = root.join("remote");
        let local = root.join("local");
        let work = root.join("work");
        fs::create_dir_all(remote.join("nested dir"))?;
        fs::create_dir_all(&local)?;
        fs::write(remote.join("a"), vec![1u8; 100])?;
        fs::write(remote.join("nested dir/b"), vec![2u8; 200])?;
        fs::write(remote.join("same"), b"unchanged")?;
        fs::write(local.join("same"), b"unchanged")?;
        let config = Config::default();

        let manifest_scratch = root.join("scratch/manifest");
        fs::create_dir_all(&manifest_scratch)?;
        let remote_manifest = make_file_manifest(&ExecutionContext::work_item(&manifest_scratch), &remote, &config, false)?;

        let request = PlanRequest {
            direction: Direction::Pull,
            remote_prefix: remote.clone(),
            remote_manifest,
            local_prefix: local.clone(),
            working_dir: work.clone(),
            test_mode: false,
            unique_id: None,
        };
        let mut dispatcher = JobFile::new(work.join(&config.files.jobs_file));
        let plan = plan_sync(&request, &config, &mut dispatcher, None)?;
        assert_eq!(plan.transfer_items.len(), 2);
        assert_eq!(plan.verify_items.len(), 1);

        let transfer_commands = work.join(&config.files.transfer_commands);
        for (index, item) in plan.transfer_items.iter().enumerate() {
            let key = format!("pull:{index}");
            let metadata = item.metadata_path(&work);
            run_job(root, &key, &[("file-for-transfer", item.local_file.as_path()), ("metadata", metadata.as_path())], |ctx| {
                pull_file(ctx, &item.remote_file, &config)
            })?;
            verify_work_item(&transfer_commands, &key, &work, &config)?;
        }

        // Not finished yet: the verify item is outstanding.
        assert!(matches!(reconcile(&plan.log)?, Verdict::WorkRemaining(_)));

        let verify_commands = work.join(&config.files.verify_commands);
        for (index, item) in plan.verify_items.iter().enumerate() {
            let key = format!("verify:{index}");
            let metadata = item.metadata_path(&work);
            run_job(root, &key, &[("metadata", metadata.as_path())], |ctx| {
                get_remote_metadata(ctx, &item.remote_file, &config)
            })?;
            verify_work_item(&verify_commands, &key, &work, &config)?;
        }

        assert_eq!(fs::read(local.join("nested dir/b"))?, vec![2u8; 200]);
        assert_eq!(reconcile(&plan.log)?, Verdict::Completed);

        // Re-planning the finished sync finds nothing to do.
        let replan = plan_sync(&request, &config, &mut dispatcher, None)?;
        assert!(replan.transfer_items.is_empty());
        assert!(replan.verify_items.is_empty());
        Ok(())
    }

    #[test]
    fn test_push_sync_end_to_end() -> Result<()> {
        let dir = TempDir::new()?;
        let root = dir.path();
        let remote = root.join("remote");
        let local = root.join("local");
        let work = root.join("work");
        fs::create_dir_all(local.join("sub"))?;
        fs::write(local.join("sub/x.txt"), b"pushed contents")?;
        let config = Config::default();

        let manifest_scratch = root.join("scratch/manifest");
        fs::create_dir_all(&manifest_scratch)?;
        let remote_manifest = make_file_manifest(&ExecutionContext::work_item(&manifest_scratch), &remote, &config, false)?;

        let request = PlanRequest {
            direction: Direction::Push,
            remote_prefix: remote.clone(),
            remote_manifest,
            local_prefix: local.clone(),
            working_dir: work.clone(),
            test_mode: false,
            unique_id: None,
        };
        let mut dispatcher = JobFile::new(work.join(&config.files.jobs_file));
        let plan = plan_sync(&request, &config, &mut dispatcher, None)?;
        assert_eq!(plan.transfer_items.len(), 1);

        let item = &plan.transfer_items[0];
        let metadata = item.metadata_path(&work);
        run_job(root, "push:0", &[("metadata", metadata.as_path())], |ctx| {
            fs::copy(&item.local_file, ctx.scratch_dir.join("x.txt"))?;
            push_file(ctx, &item.remote_file, &config)
        })?;
        verify_work_item(&work.join(&config.files.transfer_commands), "push:0", &work, &config)?;

        assert_eq!(fs::read(remote.join("sub/x.txt"))?, b"pushed contents");
        assert_eq!(reconcile(&plan.log)?, Verdict::Completed);
        Ok(())
    }
}
