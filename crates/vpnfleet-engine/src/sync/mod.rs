//! Per-server reconciliation jobs.
//!
//! A sync job repairs the gap between the subscriptions intended for a
//! server and the clients actually present on its panel. At most one job is
//! live per server; progress is observed by polling.

mod manager;

pub use manager::{SyncJob, SyncJobManager, SyncJobStatus};
