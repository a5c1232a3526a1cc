//! Expiration sweep: flips overdue subscriptions to `expired` and revokes
//! their credentials.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use vpnfleet_core::db::unix_timestamp;

use crate::error::FleetError;
use crate::fleet::FleetDistributor;
use crate::storage::{FleetDatabase, RosterSource, Subscription};

/// One revoke attempt made by a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokedClient {
    pub subscription_id: String,
    pub client_id: String,
    pub server_id: i64,
    pub ok: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub expired_count: usize,
    pub revoked: Vec<RevokedClient>,
}

pub struct ExpirationSweeper {
    db: FleetDatabase,
    roster: Arc<dyn RosterSource>,
    distributor: Arc<FleetDistributor>,
    running: Mutex<()>,
}

impl ExpirationSweeper {
    pub fn new(db: FleetDatabase, roster: Arc<dyn RosterSource>, distributor: Arc<FleetDistributor>) -> Self {
        Self {
            db,
            roster,
            distributor,
            running: Mutex::new(()),
        }
    }

    /// Expire every active subscription whose end date has passed, then
    /// retry revokes left over from earlier runs.
    ///
    /// Runs are serialized; a run that waited for another finds nothing left
    /// to do for the subscriptions that one handled.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<SweepReport, FleetError> {
        let _running = self.running.lock().await;

        let now = unix_timestamp();
        let overdue: Vec<Subscription> = self
            .roster
            .all_active_subscriptions()
            .await?
            .into_iter()
            .filter(|sub| sub.end_date < now)
            .collect();

        let mut report = SweepReport::default();
        let mut handled = HashSet::new();
        for sub in overdue {
            match self.db.expire_subscription(&sub.id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(subscription_id = %sub.id, error = %e, "Failed to expire subscription");
                    continue;
                }
            }
            report.expired_count += 1;
            self.revoke(&sub, &mut report).await;
            handled.insert(sub.id);
        }

        // Earlier revokes that did not reach every server.
        match self.db.expired_with_provisioned().await {
            Ok(stuck) => {
                for sub in stuck.into_iter().filter(|sub| !handled.contains(&sub.id)) {
                    debug!(subscription_id = %sub.id, "Retrying revoke");
                    self.revoke(&sub, &mut report).await;
                }
            }
            Err(e) => warn!(error = %e, "Cannot load expired subscriptions awaiting revoke"),
        }

        if !report.revoked.is_empty() || report.expired_count > 0 {
            info!(
                expired = report.expired_count,
                revoked = report.revoked.iter().filter(|r| r.ok).count(),
                failed = report.revoked.iter().filter(|r| !r.ok).count(),
                "Expiration sweep complete"
            );
        } else {
            debug!("Expiration sweep found nothing to do");
        }
        Ok(report)
    }

    /// Run a sweep every `every` until `shutdown` flips to `true`.
    pub fn spawn_periodic(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = every.as_secs(), "Expiration sweeper started");
            let mut timer = tokio::time::interval(every);
            // First tick fires immediately; let startup finish first.
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = self.run().await {
                            error!(error = %e, "Scheduled expiration sweep failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Expiration sweeper stopping");
                        break;
                    }
                }
            }
        })
    }

    async fn revoke(&self, sub: &Subscription, report: &mut SweepReport) {
        let servers = match self.db.provisioned_server_ids(&sub.id).await {
            Ok(ids) => self.db.get_servers(&ids).await,
            Err(e) => Err(e),
        };
        let servers = match servers {
            Ok(servers) => servers,
            Err(e) => {
                warn!(subscription_id = %sub.id, error = %e, "Cannot load servers to revoke from");
                return;
            }
        };

        let result = self.distributor.revoke(&sub.client_id, &servers).await;
        for outcome in result.per_server {
            if outcome.ok {
                if let Err(e) = self.db.remove_assignment(&sub.id, outcome.server_id).await {
                    warn!(subscription_id = %sub.id, server_id = outcome.server_id, error = %e, "Failed to drop assignment");
                }
            }
            report.revoked.push(RevokedClient {
                subscription_id: sub.id.clone(),
                client_id: sub.client_id.clone(),
                server_id: outcome.server_id,
                ok: outcome.ok,
            });
        }
    }
}
