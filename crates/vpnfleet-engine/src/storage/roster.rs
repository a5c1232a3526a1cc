//! Roster source consumed by the broadcast dispatcher and the sweeper.

use async_trait::async_trait;
use vpnfleet_core::db::DatabaseError;

use super::db::FleetDatabase;
use super::models::Subscription;

/// Source of broadcast recipients and live subscriptions.
#[async_trait]
pub trait RosterSource: Send + Sync {
    /// Chat identifiers of every recipient a broadcast should reach.
    async fn all_recipients(&self) -> Result<Vec<String>, DatabaseError>;

    /// Every subscription currently in `active` state.
    async fn all_active_subscriptions(&self) -> Result<Vec<Subscription>, DatabaseError>;
}

#[async_trait]
impl RosterSource for FleetDatabase {
    async fn all_recipients(&self) -> Result<Vec<String>, DatabaseError> {
        Ok(self
            .list_recipients(true)
            .await?
            .into_iter()
            .map(|r| r.telegram_id)
            .collect())
    }

    async fn all_active_subscriptions(&self) -> Result<Vec<Subscription>, DatabaseError> {
        self.list_active_subscriptions().await
    }
}
