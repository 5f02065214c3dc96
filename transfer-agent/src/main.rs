//! Transfer Agent - Main entry point
//!
//! Planner, worker and verification steps of a verified directory sync.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use transfer_agent::executor::{self, context::ExecutionContext, jobs::JobFile};
use transfer_agent::manifest::log::SyncLog;
use transfer_agent::manifest::Direction;
use transfer_agent::sync::{plan_sync, reconcile, PlanRequest, Verdict};
use transfer_agent::{config::Config, utils};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inventory a remote directory into the job's scratch directory
    MakeFileManifest {
        src: PathBuf,

        /// Only list small files
        #[arg(long)]
        test_mode: bool,
    },

    /// Diff both sides, open a sync epoch and write the jobs
    Plan {
        #[arg(value_enum)]
        direction: Direction,
        remote_prefix: PathBuf,
        remote_manifest: PathBuf,
        local_prefix: PathBuf,

        /// Directory for the local inventory, descriptors and job specs
        #[arg(long, default_value = ".")]
        working_dir: PathBuf,

        /// Run transfer jobs one at a time
        #[arg(long)]
        test_mode: bool,

        /// Tag every job with this id
        #[arg(long)]
        unique_id: Option<String>,
    },

    /// Copy a remote file into the job's scratch directory
    PullFile { src: PathBuf },

    /// Copy a staged file from the job's scratch directory to the remote side
    PushFile { dest: PathBuf },

    /// Hash a remote file in place
    GetRemoteMetadata { src: PathBuf },

    /// Verify a finished job's metadata and record it in the sync log
    VerifyMetadata {
        #[arg(long)]
        cmd_info: PathBuf,

        /// Dispatcher node name or item index
        #[arg(long)]
        key: String,

        /// Directory the metadata files were staged into
        #[arg(long, default_value = ".")]
        working_dir: PathBuf,
    },

    /// Replay the sync log and close the epoch if everything is verified
    Finalize { transfer_manifest: PathBuf },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!("transfer-agent v{} called with {:?}", env!("CARGO_PKG_VERSION"), args.command);

    run(args.command, &config).inspect_err(|e| tracing::error!("Error: {:#}", e))
}

fn run(command: Command, config: &Config) -> Result<()> {
    let ctx = ExecutionContext::from_env();

    match command {
        Command::MakeFileManifest { src, test_mode } => {
            let path = executor::make_file_manifest(&ctx, &src, config, test_mode)?;
            tracing::info!("Wrote file manifest {}", path.display());
        }
        Command::Plan {
            direction,
            remote_prefix,
            remote_manifest,
            local_prefix,
            working_dir,
            test_mode,
            unique_id,
        } => {
            let request = PlanRequest {
                direction,
                remote_prefix,
                remote_manifest,
                local_prefix,
                working_dir: working_dir.clone(),
                test_mode,
                unique_id,
            };
            let mut dispatcher = JobFile::new(working_dir.join(&config.files.jobs_file));
            let plan = plan_sync(&request, config, &mut dispatcher, None)?;
            tracing::info!(
                "{} {} transfer and {} verify jobs for {}",
                if plan.resumed { "Resumed" } else { "Planned" },
                plan.transfer_items.len(),
                plan.verify_items.len(),
                plan.log.path().display()
            );
        }
        Command::PullFile { src } => {
            executor::pull_file(&ctx, &src, config)?;
        }
        Command::PushFile { dest } => {
            executor::push_file(&ctx, &dest, config)?;
        }
        Command::GetRemoteMetadata { src } => {
            executor::get_remote_metadata(&ctx, &src, config)?;
        }
        Command::VerifyMetadata {
            cmd_info,
            key,
            working_dir,
        } => {
            executor::verify_work_item(&cmd_info, &key, &working_dir, config)?;
        }
        Command::Finalize { transfer_manifest } => {
            match reconcile(&SyncLog::new(transfer_manifest))? {
                Verdict::Completed => println!("Synchronization done; verification complete."),
                Verdict::AlreadyDone => println!("All synchronizations done; verification complete."),
                Verdict::WorkRemaining(remaining) => println!(
                    "Sync not done: {} files to transfer, {} files to verify.",
                    remaining.counters.files_to_transfer, remaining.counters.files_to_verify
                ),
            }
        }
    }

    Ok(())
}
