//! `vpnfleet` Core Library
//!
//! Shared functionality for `vpnfleet` components:
//! - Configuration resolution and hierarchy
//! - `SQLite` pool helpers and the shared database error
//! - Access URI (connection string) parsing and building
//! - Common error types and tracing initialisation

pub mod config;
pub mod connstr;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use config::Config;
pub use connstr::{AccessEndpoint, ConnectionParams, build_access_uri, parse_access_uri};
pub use error::{Error, Result};
