//! Engine-level error type.
//!
//! Batch operations (distribute, revoke, sweep, migrate) never return these
//! for partial failures; per-server problems are recorded in their reports.
//! Only pre-flight validation, missing entities, sync conflicts and storage
//! failures surface here.

use thiserror::Error;

use crate::storage::DatabaseError;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(DatabaseError),
}

impl From<DatabaseError> for FleetError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::NotFound(what),
            DatabaseError::Constraint(msg) => Self::Conflict(msg),
            other => Self::Storage(other),
        }
    }
}
