//! File system helpers: directory scanning and metadata preservation.

pub mod metadata;
pub mod walker;

pub use walker::{scan, FileInfo, ScanOptions};
