//! Fleet fan-out.
//!
//! Pushes one credential to (or pulls it from) many independently managed
//! servers at once and aggregates the per-server outcomes. There is no
//! rollback across servers; divergence is repaired later by a sync job.

mod distributor;

pub use distributor::{FleetDistributor, FleetResult, ServerOutcome};
