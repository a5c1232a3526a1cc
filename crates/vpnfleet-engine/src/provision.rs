//! Subscription lifecycle: create, extend and delete.
//!
//! The local record is authoritative. It is written before any panel is
//! contacted, and neither creation nor deletion is blocked by remote
//! failures; those only show up in the returned [`FleetResult`].

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use vpnfleet_core::db::{SECS_PER_DAY, unix_timestamp};

use crate::error::FleetError;
use crate::fleet::{FleetDistributor, FleetResult};
use crate::panel::ClientSpec;
use crate::storage::{
    FleetDatabase, NewSubscription, Server, Subscription, SubscriptionSource, SubscriptionStatus,
};

/// Longest accepted term for a single create or extend.
const MAX_DAYS: i64 = 3650;

/// Which servers a new subscription is pushed to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "id")]
pub enum ServerTarget {
    /// Every active server outside inactive pools.
    #[default]
    All,
    /// Active servers of one active pool.
    Pool(i64),
    /// An explicit server list.
    Servers(Vec<i64>),
}

/// Request to create a subscription.
#[derive(Debug, Clone, Default)]
pub struct CreateSubscription {
    pub days: i64,
    pub owner_ref: Option<String>,
    pub note: Option<String>,
    pub source: SubscriptionSource,
    pub target: ServerTarget,
    pub device_limit: Option<i64>,
    pub traffic_limit: Option<i64>,
}

pub struct Provisioner {
    db: FleetDatabase,
    distributor: Arc<FleetDistributor>,
    default_device_limit: i64,
}

impl Provisioner {
    pub const fn new(db: FleetDatabase, distributor: Arc<FleetDistributor>, default_device_limit: i64) -> Self {
        Self {
            db,
            distributor,
            default_device_limit,
        }
    }

    /// Issue a new credential and push it to the target servers.
    #[instrument(skip(self, req), fields(days = req.days, source = req.source.as_str()))]
    pub async fn create(&self, req: CreateSubscription) -> Result<(Subscription, FleetResult), FleetError> {
        validate_days(req.days)?;
        let device_limit = req.device_limit.unwrap_or(self.default_device_limit);
        if device_limit < 0 {
            return Err(FleetError::Validation("deviceLimit must not be negative".into()));
        }
        if req.traffic_limit.is_some_and(|t| t < 0) {
            return Err(FleetError::Validation("trafficLimit must not be negative".into()));
        }

        let servers = self.resolve_targets(&req.target).await?;

        let now = unix_timestamp();
        let id = Uuid::new_v4().to_string();
        let client_id = Uuid::new_v4().to_string();
        let sub = self
            .db
            .create_subscription(&NewSubscription {
                id: &id,
                client_id: &client_id,
                owner_ref: req.owner_ref.as_deref().filter(|o| !o.is_empty()),
                source: req.source,
                note: req.note.as_deref().filter(|n| !n.is_empty()),
                start_date: now,
                end_date: now + req.days * SECS_PER_DAY,
                period_days: req.days,
                device_limit,
                traffic_limit: req.traffic_limit,
            })
            .await?;

        let server_ids: Vec<i64> = servers.iter().map(|s| s.id).collect();
        self.db.assign_servers(&sub.id, &server_ids).await?;

        let spec = ClientSpec::for_subscription(&sub, None);
        let result = self.distributor.distribute(&spec, &servers).await;
        self.record_provisioned(&sub.id, &result).await;

        info!(
            subscription_id = %sub.id,
            client_id = %sub.client_id,
            servers_success = result.servers_success,
            servers_failed = result.servers_failed,
            "Subscription created"
        );
        Ok((sub, result))
    }

    /// Push the end date out by `days`. Local only; an expired subscription
    /// whose new end lies in the future becomes active again.
    #[instrument(skip(self))]
    pub async fn extend(&self, id: &str, days: i64) -> Result<Subscription, FleetError> {
        validate_days(days)?;
        let sub = self.db.get_subscription(id).await?;

        let end_date = sub.end_date + days * SECS_PER_DAY;
        let status = if sub.status == SubscriptionStatus::Expired && end_date > unix_timestamp() {
            SubscriptionStatus::Active
        } else {
            sub.status
        };

        let updated = self
            .db
            .update_subscription_term(id, end_date, sub.period_days + days, status)
            .await?;
        info!(subscription_id = %id, end_date, status = %updated.status, "Subscription extended");
        Ok(updated)
    }

    /// Revoke the credential from every server it was provisioned on and
    /// delete the record, whatever the revoke outcome.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<FleetResult, FleetError> {
        let sub = self.db.get_subscription(id).await?;
        let server_ids = self.db.provisioned_server_ids(id).await?;
        let servers = self.db.get_servers(&server_ids).await?;

        let result = self.distributor.revoke(&sub.client_id, &servers).await;
        if result.servers_failed > 0 {
            warn!(
                subscription_id = %id,
                failed = result.servers_failed,
                "Deleting subscription despite failed revokes"
            );
        }

        self.db.delete_subscription(id).await?;
        info!(subscription_id = %id, client_id = %sub.client_id, "Subscription deleted");
        Ok(result)
    }

    async fn resolve_targets(&self, target: &ServerTarget) -> Result<Vec<Server>, FleetError> {
        match target {
            ServerTarget::All => Ok(self.db.fanout_targets(None).await?),
            ServerTarget::Pool(pool_id) => {
                self.db.get_pool(*pool_id).await?;
                Ok(self.db.fanout_targets(Some(*pool_id)).await?)
            }
            ServerTarget::Servers(ids) => {
                let servers = self.db.get_servers(ids).await?;
                if let Some(missing) = ids.iter().find(|id| !servers.iter().any(|s| s.id == **id)) {
                    return Err(FleetError::NotFound(format!("Server {missing}")));
                }
                Ok(servers)
            }
        }
    }

    async fn record_provisioned(&self, subscription_id: &str, result: &FleetResult) {
        for server_id in result.succeeded() {
            if let Err(e) = self.db.set_provisioned(subscription_id, server_id, true).await {
                warn!(subscription_id, server_id, error = %e, "Failed to record provisioned server");
            }
        }
    }
}

fn validate_days(days: i64) -> Result<(), FleetError> {
    if (1..=MAX_DAYS).contains(&days) {
        Ok(())
    } else {
        Err(FleetError::Validation(format!(
            "days must be between 1 and {MAX_DAYS}, got {days}"
        )))
    }
}
