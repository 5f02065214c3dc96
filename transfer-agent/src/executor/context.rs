//! Where a worker command is running.

use std::ffi::OsString;
use std::path::PathBuf;

use crate::utils::errors::{Result, TransferError};

/// Scratch directory the dispatcher stages files into and out of.
pub const SCRATCH_DIR_VAR: &str = "_CONDOR_SCRATCH_DIR";

/// Set by the dispatcher only inside a running work item.
pub const JOB_AD_VAR: &str = "_CONDOR_JOB_AD";

/// Environment of a worker command, resolved once by the binary and passed
/// down explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub scratch_dir: PathBuf,
    /// Job description file; `None` outside a work item
    pub job_ad: Option<PathBuf>,
    pub host: String,
}

impl ExecutionContext {
    /// Resolve the context from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var_os(name))
    }

    /// Resolve the context from an arbitrary variable lookup.
    pub fn from_vars<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            scratch_dir: lookup(SCRATCH_DIR_VAR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            job_ad: lookup(JOB_AD_VAR).map(PathBuf::from),
            host,
        }
    }

    /// Work-item context over a local scratch directory, for tests that play
    /// the dispatcher.
    #[cfg(test)]
    pub(crate) fn work_item(scratch_dir: impl Into<PathBuf>) -> Self {
        let scratch_dir = scratch_dir.into();
        Self {
            job_ad: Some(scratch_dir.join(".job.ad")),
            scratch_dir,
            host: "localhost".to_string(),
        }
    }

    pub fn is_work_item(&self) -> bool {
        self.job_ad.is_some()
    }

    /// Fail unless running inside a dispatched work item.
    pub fn require_work_item(&self) -> Result<()> {
        if self.is_work_item() {
            Ok(())
        } else {
            Err(TransferError::NotAWorkItem(format!(
                "This step must be run as a dispatched job ({} is not set on {})",
                JOB_AD_VAR, self.host
            )))
        }
    }
}
