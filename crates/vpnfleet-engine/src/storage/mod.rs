//! SQLite storage for the vpnfleet engine.
//!
//! Provides persistence for subscriptions, their per-server assignments,
//! the server catalogue (servers and pools) and bot recipients.

mod db;
mod models;
mod queries;
mod queries_fleet;
mod queries_recipients;
mod roster;


pub use db::FleetDatabase;
pub use models::*;
pub use queries::{NewSubscription, SubscriptionFilter};
pub use queries_fleet::{NewServer, NewServerPool, ServerPoolUpdate, ServerUpdate};
pub use queries_recipients::NewRecipient;
pub use roster::RosterSource;
pub use vpnfleet_core::db::DatabaseError;
