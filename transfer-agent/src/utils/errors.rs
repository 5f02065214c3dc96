//! Custom error types for the transfer agent.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Invalid manifest entry: {0}")]
    InvalidManifestEntry(String),

    #[error(
        "Failed to parse manifest entry at {}:{line_number} (\"{line}\"): {reason}",
        .path.display()
    )]
    MalformedLine {
        path: PathBuf,
        line_number: usize,
        line: String,
        reason: String,
    },

    #[error("Inconsistent manifest: {0}")]
    InconsistentManifest(String),

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Transfer already running: {0}")]
    TransferAlreadyRunning(String),

    #[error("Not running as a work item: {0}")]
    NotAWorkItem(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TransferError>;
