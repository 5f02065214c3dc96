//! Utility modules for the transfer agent.

pub mod errors;
pub mod logger;

pub use errors::{Result, TransferError};
