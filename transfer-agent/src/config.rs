//! Configuration management for the transfer agent.
//!
//! Loads configuration from a TOML file with `TRANSFER_AGENT__*` environment
//! variable overrides (e.g. `TRANSFER_AGENT__SYNC__BLOCK_SIZE=4194304`).

use crate::utils::errors::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;

/// Prefix for environment variable overrides.
const ENV_PREFIX: &str = "TRANSFER_AGENT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub files: FilesConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Read/write block size for hashing and copying (default: 1MB)
    pub block_size: usize,

    /// Seconds between progress log lines while hashing or copying
    pub progress_interval_secs: u64,

    /// Largest file included in an inventory when running in test mode
    pub test_mode_max_file_size: u64,

    /// Largest accepted worker metadata file
    pub metadata_size_limit: u64,
}

/// Well-known file names shared between the planner, the workers and the
/// verification step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    /// Name of the pulled file inside a worker's scratch directory
    pub sandbox_file: String,

    /// Name of the worker's metadata output inside its scratch directory
    pub metadata_file: String,

    pub local_manifest: String,
    pub remote_manifest: String,

    /// Sync log name, relative to the local prefix
    pub transfer_manifest: String,

    pub transfer_commands: String,
    pub verify_commands: String,

    /// Dispatcher job specs written next to the descriptor files
    pub jobs_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            block_size: MB as usize,
            progress_interval_secs: 5,
            test_mode_max_file_size: 50 * MB,
            metadata_size_limit: 16 * KB,
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            sandbox_file: "file-for-transfer".to_string(),
            metadata_file: "metadata".to_string(),
            local_manifest: "local_manifest.txt".to_string(),
            remote_manifest: "remote_manifest.txt".to_string(),
            transfer_manifest: "transfer_manifest.txt".to_string(),
            transfer_commands: "transfer_commands.json".to_string(),
            verify_commands: "verify_commands.json".to_string(),
            jobs_file: "jobs.json".to_string(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| TransferError::Config(format!("{}: {}", path.display(), e)))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| TransferError::Config(format!("{}: {}", path.display(), e)))?;

        if config.sync.block_size == 0 {
            return Err(TransferError::Config("sync.block_size must be non-zero".to_string()));
        }

        Ok(config)
    }
}
