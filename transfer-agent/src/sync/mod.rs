//! Sync planning and reconciliation over the sync log.

pub mod diff;
pub mod plan;
pub mod reconcile;

pub use diff::{compute_diff, flatten_path, SyncDiff};
pub use plan::{plan_sync, Plan, PlanRequest};
pub use reconcile::{reconcile, Reconciler, Verdict};
