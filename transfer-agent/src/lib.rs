//! Transfer Agent Library
//!
//! Verified, resumable directory synchronization driven by an append-only
//! transfer manifest.

pub mod config;
pub mod executor;
pub mod fs;
pub mod manifest;
pub mod sync;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::TransferError;
pub type Result<T> = std::result::Result<T, TransferError>;
