//! Bulk rewrite of client labels on one server.
//!
//! Panels identify clients to humans by their `email` label. Labels written
//! by older tooling are rewritten to the canonical `sub-<id prefix>[-owner]`
//! form so operators can map panel rows back to subscriptions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::error::FleetError;
use crate::panel::{ClientSpec, PanelConnector, PanelError, with_timeout};
use crate::storage::FleetDatabase;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub total: usize,
    pub updated: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

pub struct IdentityMigrator {
    db: FleetDatabase,
    connector: Arc<dyn PanelConnector>,
    parallelism: usize,
    call_timeout: Duration,
}

impl IdentityMigrator {
    pub fn new(
        db: FleetDatabase,
        connector: Arc<dyn PanelConnector>,
        parallelism: usize,
        call_timeout: Duration,
    ) -> Self {
        Self {
            db,
            connector,
            parallelism: parallelism.max(1),
            call_timeout,
        }
    }

    /// Rewrite the labels of every known client on a server.
    ///
    /// Only an unknown server is a hard error; listing or update failures
    /// are reported in the returned counts.
    #[instrument(skip(self))]
    pub async fn migrate(&self, server_id: i64) -> Result<MigrationReport, FleetError> {
        let server = self.db.get_server(server_id).await?;
        let mut report = MigrationReport::default();

        let listed = match self.connector.connect(&server) {
            Ok(panel) => match with_timeout(self.call_timeout, panel.list_clients()).await {
                Ok(clients) => Ok((panel, clients)),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        let (panel, remote) = match listed {
            Ok(found) => found,
            Err(e) => {
                warn!(server_id, error = %e, "Cannot list clients for migration");
                report.errors.push(format!("cannot list clients: {e}"));
                return Ok(report);
            }
        };

        let ids: Vec<String> = remote.iter().map(|c| c.id.clone()).collect();
        let known: HashMap<String, _> = self
            .db
            .get_subscriptions_by_client_ids(&ids)
            .await?
            .into_iter()
            .map(|sub| (sub.client_id.clone(), sub))
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut tasks = JoinSet::new();

        for client in remote {
            let Some(sub) = known.get(&client.id) else {
                continue;
            };
            report.total += 1;

            let mut spec = ClientSpec::for_subscription(sub, server.flow.as_deref());
            if client.email == spec.email {
                report.updated += 1;
                continue;
            }
            spec.enable = client.enable;

            let panel = Arc::clone(&panel);
            let semaphore = Arc::clone(&semaphore);
            let limit = self.call_timeout;
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => with_timeout(limit, panel.update_client(&spec)).await,
                    Err(_) => Err(PanelError::Config("migration pool closed".into())),
                };
                (spec.id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.updated += 1,
                Ok((client_id, Err(e))) => {
                    warn!(server_id, %client_id, error = %e, "Label update failed");
                    report.failed += 1;
                    report.errors.push(format!("{client_id}: {e}"));
                }
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(format!("task failed: {e}"));
                }
            }
        }

        info!(
            server_id,
            total = report.total,
            updated = report.updated,
            failed = report.failed,
            "Client identity migration finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::panel::{RemoteClient, canonical_label};
    use crate::test_helpers::{MockConnector, MockPanel, stored_server, stored_subscription, test_db};

    fn remote(id: &str, email: &str) -> RemoteClient {
        RemoteClient {
            id: id.to_string(),
            email: email.to_string(),
            enable: true,
        }
    }

    #[tokio::test]
    async fn rewrites_known_labels_and_skips_strangers() {
        let db = test_db().await;
        let srv = stored_server(&db, "a").await;
        let s1 = stored_subscription(&db, "s1", 30).await;
        let s2 = stored_subscription(&db, "s2", 30).await;
        let s3 = stored_subscription(&db, "s3", 30).await;

        let connector = Arc::new(MockConnector::new());
        connector.set_panel(
            srv.id,
            MockPanel::healthy()
                .with_clients(vec![
                    remote(&s1.client_id, "user1@legacy"),
                    remote(&s2.client_id, &canonical_label(&s2.client_id, None)),
                    remote(&s3.client_id, "legacy-3"),
                    remote("stranger", "someone"),
                ])
                .failing_for(&s3.client_id),
        );
        let migrator = IdentityMigrator::new(db.clone(), connector.clone(), 4, Duration::from_secs(5));

        let report = migrator.migrate(srv.id).await.unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.updated, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors.len(), 1);

        let updated = connector.panel(srv.id).updated();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].id, s1.client_id);
        assert_eq!(updated[0].email, canonical_label(&s1.client_id, None));
    }

    #[tokio::test]
    async fn unreachable_server_is_reported_not_raised() {
        let db = test_db().await;
        let srv = stored_server(&db, "a").await;
        let connector = Arc::new(MockConnector::new());
        connector.set_panel(srv.id, MockPanel::unreachable());
        let migrator = IdentityMigrator::new(db.clone(), connector, 4, Duration::from_secs(5));

        let report = migrator.migrate(srv.id).await.unwrap();
        assert_eq!(report.total, 0);
        assert_eq!(report.errors.len(), 1);
    }

    #[tokio::test]
    async fn unknown_server_is_not_found() {
        let db = test_db().await;
        let migrator =
            IdentityMigrator::new(db, Arc::new(MockConnector::new()), 4, Duration::from_secs(5));
        assert!(matches!(migrator.migrate(9).await, Err(FleetError::NotFound(_))));
    }
}
