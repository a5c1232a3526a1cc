//! vpnfleet Engine Library
//!
//! Subscription provisioning and proxy fleet synchronization:
//! - SQLite storage for subscriptions, servers, pools and recipients
//! - Remote panel client and concurrent fan-out across the fleet
//! - Per-server sync jobs with pollable progress
//! - Expiration sweeps, identity migration and notification dispatch
//! - JSON HTTP API over all of the above

pub mod api;
pub mod error;
pub mod fleet;
pub mod links;
pub mod messaging;
pub mod migrate;
pub mod onboard;
pub mod panel;
pub mod provision;
pub mod storage;
pub mod sweeper;
pub mod sync;

#[cfg(test)]
mod test_helpers;
