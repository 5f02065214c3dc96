//! Content hashing and verified copies.

pub mod hash;
pub mod progress;

pub use hash::{copy_with_hash, hash_file, HashOptions, HashResult};
