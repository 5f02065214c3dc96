//! Manifest entry types for the transfer manifest.
//!
//! Every line of a manifest is one tagged record, `TAG {json-object}`. The
//! same vocabulary is used for file inventories (`FILE`), worker metadata
//! (`METADATA`) and the append-only sync log (requests, verifications and
//! epoch markers).
//!
//! Wire tags are explicit constants in [`tags`] and never derived from Rust
//! type names, so renaming a type can't change the on-disk format.

pub mod inventory;
pub mod log;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::utils::errors::{Result, TransferError};

/// Wire tags, one per entry kind.
pub mod tags {
    pub const FILE: &str = "FILE";
    pub const METADATA: &str = "METADATA";
    pub const TRANSFER_REQUEST: &str = "TRANSFER_REQUEST";
    pub const VERIFY_REQUEST: &str = "VERIFY_REQUEST";
    pub const TRANSFER_VERIFIED: &str = "TRANSFER_VERIFIED";
    pub const SYNC_REQUEST: &str = "SYNC_REQUEST";
    pub const SYNC_DONE: &str = "SYNC_DONE";
}

/// Registration table: wire tag and required keys of every entry kind.
const REGISTRY: &[(&str, &[&str])] = &[
    (FileEntry::TAG, FileEntry::KEYS),
    (Metadata::TAG, Metadata::KEYS),
    (TransferRequest::TAG, TransferRequest::KEYS),
    (VerifyRequest::TAG, VerifyRequest::KEYS),
    (TransferVerified::TAG, TransferVerified::KEYS),
    (SyncRequest::TAG, SyncRequest::KEYS),
    (SyncDone::TAG, SyncDone::KEYS),
];

/// Transfer direction, from the point of view of the local host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Remote is the source, local is the destination.
    Pull,
    /// Local is the source, remote is the destination.
    Push,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Pull => "pull",
            Direction::Push => "push",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name and size, shared by every per-file entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub name: PathBuf,
    pub size: u64,
}

impl FileRef {
    pub fn new(name: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }
}

/// One file of an inventory snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    #[serde(flatten)]
    pub file: FileRef,
}

/// Content fingerprint of a single file, produced by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(flatten)]
    pub file: FileRef,
    pub digest: String,
}

/// "This file must be copied."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    #[serde(flatten)]
    pub file: FileRef,
}

/// "This file must be re-hashed and compared, not copied."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyRequest {
    #[serde(flatten)]
    pub file: FileRef,
}

/// Durable proof that a file passed verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferVerified {
    #[serde(flatten)]
    pub file: FileRef,
    pub digest: String,
    pub timestamp: f64,
}

/// Opens a synchronization epoch and records its initial work budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub direction: Direction,
    pub remote_prefix: PathBuf,
    pub files_at_source: u64,
    pub files_to_transfer: u64,
    pub bytes_to_transfer: u64,
    pub files_to_verify: u64,
    pub bytes_to_verify: u64,
    pub timestamp: f64,
}

/// Closes the current epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDone {
    pub timestamp: f64,
}

/// A single manifest record.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestEntry {
    File(FileEntry),
    Metadata(Metadata),
    TransferRequest(TransferRequest),
    VerifyRequest(VerifyRequest),
    TransferVerified(TransferVerified),
    SyncRequest(SyncRequest),
    SyncDone(SyncDone),
}

/// Capability shared by every concrete entry kind.
pub trait Entry: Serialize + DeserializeOwned + Sized {
    const TAG: &'static str;
    const KEYS: &'static [&'static str];

    fn into_entry(self) -> ManifestEntry;

    /// Narrow a [`ManifestEntry`] to this kind, handing it back on mismatch.
    fn from_entry(entry: ManifestEntry) -> std::result::Result<Self, ManifestEntry>;
}

macro_rules! entry_kind {
    ($ty:ident, $variant:ident, $tag:expr, [$($key:literal),+ $(,)?]) => {
        impl Entry for $ty {
            const TAG: &'static str = $tag;
            const KEYS: &'static [&'static str] = &[$($key),+];

            fn into_entry(self) -> ManifestEntry {
                ManifestEntry::$variant(self)
            }

            fn from_entry(entry: ManifestEntry) -> std::result::Result<Self, ManifestEntry> {
                match entry {
                    ManifestEntry::$variant(inner) => Ok(inner),
                    other => Err(other),
                }
            }
        }

        impl From<$ty> for ManifestEntry {
            fn from(entry: $ty) -> Self {
                ManifestEntry::$variant(entry)
            }
        }
    };
}

entry_kind!(FileEntry, File, tags::FILE, ["name", "size"]);
entry_kind!(Metadata, Metadata, tags::METADATA, ["name", "size", "digest"]);
entry_kind!(TransferRequest, TransferRequest, tags::TRANSFER_REQUEST, ["name", "size"]);
entry_kind!(VerifyRequest, VerifyRequest, tags::VERIFY_REQUEST, ["name", "size"]);
entry_kind!(
    TransferVerified,
    TransferVerified,
    tags::TRANSFER_VERIFIED,
    ["name", "size", "digest", "timestamp"]
);
entry_kind!(
    SyncRequest,
    SyncRequest,
    tags::SYNC_REQUEST,
    [
        "direction",
        "remote_prefix",
        "files_at_source",
        "files_to_transfer",
        "bytes_to_transfer",
        "files_to_verify",
        "bytes_to_verify",
        "timestamp",
    ]
);
entry_kind!(SyncDone, SyncDone, tags::SYNC_DONE, ["timestamp"]);

impl FileEntry {
    pub fn new(name: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            file: FileRef::new(name, size),
        }
    }
}

impl Metadata {
    pub fn new(name: impl Into<PathBuf>, size: u64, digest: impl Into<String>) -> Self {
        Self {
            file: FileRef::new(name, size),
            digest: digest.into(),
        }
    }
}

impl TransferRequest {
    pub fn new(name: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            file: FileRef::new(name, size),
        }
    }
}

impl VerifyRequest {
    pub fn new(name: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            file: FileRef::new(name, size),
        }
    }
}

impl TransferVerified {
    pub fn new(name: impl Into<PathBuf>, size: u64, digest: impl Into<String>, timestamp: f64) -> Self {
        Self {
            file: FileRef::new(name, size),
            digest: digest.into(),
            timestamp,
        }
    }
}

impl SyncDone {
    pub fn now() -> Self {
        Self {
            timestamp: timestamp(),
        }
    }
}

/// Current wall-clock time as float seconds since the Unix epoch.
pub fn timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

impl ManifestEntry {
    /// Build an entry from its wire tag and a field mapping.
    ///
    /// Missing keys are an error; unknown extra keys are ignored with a
    /// warning so that newer writers can add fields.
    pub fn construct(tag: &str, info: Map<String, Value>) -> Result<Self> {
        let keys = required_keys(tag)?;

        let missing: Vec<&str> = keys
            .iter()
            .copied()
            .filter(|key| !info.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            return Err(TransferError::InvalidManifestEntry(format!(
                "{} entry {} is missing keys: {}",
                tag,
                Value::Object(info),
                missing.join(", ")
            )));
        }

        let extra: Vec<&str> = info
            .keys()
            .map(String::as_str)
            .filter(|key| !keys.contains(key))
            .collect();
        if !extra.is_empty() {
            warn!("{} entry has extra keys: {}", tag, extra.join(", "));
        }

        let value = Value::Object(info);
        match tag {
            tags::FILE => from_info::<FileEntry>(value),
            tags::METADATA => from_info::<Metadata>(value),
            tags::TRANSFER_REQUEST => from_info::<TransferRequest>(value),
            tags::VERIFY_REQUEST => from_info::<VerifyRequest>(value),
            tags::TRANSFER_VERIFIED => from_info::<TransferVerified>(value),
            tags::SYNC_REQUEST => from_info::<SyncRequest>(value),
            tags::SYNC_DONE => from_info::<SyncDone>(value),
            other => Err(unknown_tag(other)),
        }
    }

    /// Parse one manifest line, `TAG {json-object}`.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (tag, info) = line.split_once(char::is_whitespace).ok_or_else(|| {
            TransferError::InvalidManifestEntry(format!("entry has no JSON body: {:?}", line))
        })?;

        let info: Map<String, Value> = serde_json::from_str(info.trim()).map_err(|e| {
            TransferError::InvalidManifestEntry(format!("malformed JSON for {}: {}", tag, e))
        })?;

        Self::construct(tag, info)
    }

    /// Render this entry as one manifest line, including the trailing newline.
    pub fn to_line(&self) -> Result<String> {
        let json = match self {
            ManifestEntry::File(e) => serde_json::to_string(e)?,
            ManifestEntry::Metadata(e) => serde_json::to_string(e)?,
            ManifestEntry::TransferRequest(e) => serde_json::to_string(e)?,
            ManifestEntry::VerifyRequest(e) => serde_json::to_string(e)?,
            ManifestEntry::TransferVerified(e) => serde_json::to_string(e)?,
            ManifestEntry::SyncRequest(e) => serde_json::to_string(e)?,
            ManifestEntry::SyncDone(e) => serde_json::to_string(e)?,
        };
        Ok(format!("{} {}\n", self.tag(), json))
    }

    pub fn tag(&self) -> &'static str {
        match self {
            ManifestEntry::File(_) => FileEntry::TAG,
            ManifestEntry::Metadata(_) => Metadata::TAG,
            ManifestEntry::TransferRequest(_) => TransferRequest::TAG,
            ManifestEntry::VerifyRequest(_) => VerifyRequest::TAG,
            ManifestEntry::TransferVerified(_) => TransferVerified::TAG,
            ManifestEntry::SyncRequest(_) => SyncRequest::TAG,
            ManifestEntry::SyncDone(_) => SyncDone::TAG,
        }
    }

    /// The per-file part of the entry, if it has one.
    pub fn file(&self) -> Option<&FileRef> {
        match self {
            ManifestEntry::File(e) => Some(&e.file),
            ManifestEntry::Metadata(e) => Some(&e.file),
            ManifestEntry::TransferRequest(e) => Some(&e.file),
            ManifestEntry::VerifyRequest(e) => Some(&e.file),
            ManifestEntry::TransferVerified(e) => Some(&e.file),
            ManifestEntry::SyncRequest(_) | ManifestEntry::SyncDone(_) => None,
        }
    }

    pub fn name(&self) -> Option<&Path> {
        self.file().map(|f| f.name.as_path())
    }

    pub fn size(&self) -> Option<u64> {
        self.file().map(|f| f.size)
    }

    pub fn timestamp(&self) -> Option<f64> {
        match self {
            ManifestEntry::TransferVerified(e) => Some(e.timestamp),
            ManifestEntry::SyncRequest(e) => Some(e.timestamp),
            ManifestEntry::SyncDone(e) => Some(e.timestamp),
            _ => None,
        }
    }

    /// Narrow to a specific kind, failing with `InvalidManifestEntry` otherwise.
    pub fn expect<T: Entry>(self) -> Result<T> {
        T::from_entry(self).map_err(|other| {
            TransferError::InvalidManifestEntry(format!(
                "Expected a {}, but got a {}",
                T::TAG,
                other.tag()
            ))
        })
    }
}

impl fmt::Display for ManifestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let line = self.to_line().map_err(|_| fmt::Error)?;
        f.write_str(line.trim_end())
    }
}

fn required_keys(tag: &str) -> Result<&'static [&'static str]> {
    REGISTRY
        .iter()
        .find(|(known, _)| *known == tag)
        .map(|(_, keys)| *keys)
        .ok_or_else(|| unknown_tag(tag))
}

fn unknown_tag(tag: &str) -> TransferError {
    TransferError::InvalidManifestEntry(format!("unknown entry type {:?}", tag))
}

fn from_info<T: Entry>(value: Value) -> Result<ManifestEntry> {
    serde_json::from_value::<T>(value)
        .map(Entry::into_entry)
        .map_err(|e| TransferError::InvalidManifestEntry(format!("bad {} entry: {}", T::TAG, e)))
}
