//! Sync job state machine: `pending -> in-progress -> {completed, failed}`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use vpnfleet_core::db::{DatabaseError, unix_timestamp};

use crate::error::FleetError;
use crate::panel::{ClientSpec, PanelClient, PanelConnector, with_timeout};
use crate::storage::{FleetDatabase, Server, Subscription, SubscriptionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncJobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl SyncJobStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Snapshot of a sync job.
///
/// `total` is the server's roster size when the job started. Clients already
/// on the panel, and records that stopped being active before their push,
/// count as processed successfully. `error` is only set when the job could
/// not run at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJob {
    pub server_id: i64,
    pub status: SyncJobStatus,
    pub total: u64,
    pub processed: u64,
    pub success: u64,
    pub failed: u64,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub estimated_duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncJob {
    fn pending(server_id: i64, estimated_duration_ms: u64) -> Self {
        Self {
            server_id,
            status: SyncJobStatus::Pending,
            total: 0,
            processed: 0,
            success: 0,
            failed: 0,
            started_at: unix_timestamp(),
            completed_at: None,
            estimated_duration_ms,
            error: None,
        }
    }
}

type JobMap = Arc<DashMap<i64, SyncJob>>;

/// Owns the job slots and runs reconciliations in the background.
///
/// Jobs cannot be cancelled once started; they run until the worklist is
/// exhausted or the process exits.
pub struct SyncJobManager {
    jobs: JobMap,
    db: FleetDatabase,
    connector: Arc<dyn PanelConnector>,
    call_timeout: Duration,
    per_client_ms: u64,
    tracker: TaskTracker,
}

impl SyncJobManager {
    pub fn new(
        db: FleetDatabase,
        connector: Arc<dyn PanelConnector>,
        call_timeout: Duration,
        per_client_ms: u64,
    ) -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            db,
            connector,
            call_timeout,
            per_client_ms,
            tracker: TaskTracker::new(),
        }
    }

    /// Start a sync job for a server.
    ///
    /// Fails with `Conflict` while a job for the same server is pending or in
    /// progress; a finished job is superseded.
    #[instrument(skip(self))]
    pub async fn start(&self, server_id: i64) -> Result<SyncJob, FleetError> {
        let server = self.db.get_server(server_id).await?;
        let roster = self.db.roster_for_server(server_id).await?;
        let total = roster.len() as u64;
        let mut job = SyncJob::pending(server_id, total.saturating_mul(self.per_client_ms));
        job.total = total;

        match self.jobs.entry(server_id) {
            Entry::Occupied(mut slot) => {
                if !slot.get().status.is_terminal() {
                    return Err(FleetError::Conflict(format!(
                        "sync already running for server {server_id}"
                    )));
                }
                slot.insert(job.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(job.clone());
            }
        }

        info!(
            server_id,
            roster_size = total,
            estimated_duration_ms = job.estimated_duration_ms,
            "Sync job started"
        );

        let ctx = JobContext {
            jobs: Arc::clone(&self.jobs),
            db: self.db.clone(),
            connector: Arc::clone(&self.connector),
            call_timeout: self.call_timeout,
        };
        self.tracker.spawn(ctx.run(server, roster));

        Ok(job)
    }

    /// Current snapshot of the server's job, if any.
    pub fn poll(&self, server_id: i64) -> Option<SyncJob> {
        self.jobs.get(&server_id).map(|job| job.clone())
    }

    /// Drop a finished job record.
    pub fn clear(&self, server_id: i64) -> Result<(), FleetError> {
        if self
            .jobs
            .remove_if(&server_id, |_, job| job.status.is_terminal())
            .is_some()
        {
            return Ok(());
        }
        if self.jobs.contains_key(&server_id) {
            Err(FleetError::Conflict(format!(
                "sync for server {server_id} is still running"
            )))
        } else {
            Err(FleetError::NotFound(format!("sync job for server {server_id}")))
        }
    }

    /// Wait for running jobs to finish. New jobs can no longer be awaited
    /// after this returns.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

struct JobContext {
    jobs: JobMap,
    db: FleetDatabase,
    connector: Arc<dyn PanelConnector>,
    call_timeout: Duration,
}

impl JobContext {
    fn update(&self, server_id: i64, f: impl FnOnce(&mut SyncJob)) {
        if let Some(mut job) = self.jobs.get_mut(&server_id) {
            f(job.value_mut());
        }
    }

    async fn run(self, server: Server, roster: Vec<Subscription>) {
        let server_id = server.id;
        self.update(server_id, |job| job.status = SyncJobStatus::InProgress);

        let outcome = self.reconcile(&server, &roster).await;
        let finished_at = unix_timestamp();

        match outcome {
            Ok(()) => {
                self.update(server_id, |job| {
                    job.status = SyncJobStatus::Completed;
                    job.completed_at = Some(finished_at);
                });
                if let Some(job) = self.jobs.get(&server_id) {
                    info!(
                        server_id,
                        total = job.total,
                        success = job.success,
                        failed = job.failed,
                        "Sync job completed"
                    );
                }
            }
            Err(error) => {
                warn!(server_id, %error, "Sync job failed");
                self.update(server_id, |job| {
                    job.status = SyncJobStatus::Failed;
                    job.completed_at = Some(finished_at);
                    job.error = Some(error);
                });
            }
        }
    }

    /// Push every intended-but-missing client. Errors returned here abort
    /// the whole job; per-client failures are only counted.
    async fn reconcile(&self, server: &Server, roster: &[Subscription]) -> Result<(), String> {
        let panel = self
            .connector
            .connect(server)
            .map_err(|e| format!("cannot reach panel: {e}"))?;
        let remote = with_timeout(self.call_timeout, panel.list_clients())
            .await
            .map_err(|e| format!("cannot list remote clients: {e}"))?;
        let remote_ids: HashSet<&str> = remote.iter().map(|c| c.id.as_str()).collect();

        for sub in roster {
            let ok = if remote_ids.contains(sub.client_id.as_str()) {
                self.record_present(server.id, sub).await;
                true
            } else {
                self.push_missing(panel.as_ref(), server, sub).await
            };
            self.update(server.id, |job| {
                job.processed += 1;
                if ok {
                    job.success += 1;
                } else {
                    job.failed += 1;
                }
            });
        }

        Ok(())
    }

    async fn record_present(&self, server_id: i64, sub: &Subscription) {
        if let Err(e) = self.db.mark_provisioned_if_active(&sub.id, server_id).await {
            warn!(server_id, subscription_id = %sub.id, error = %e, "Failed to record provisioned client");
        }
    }

    /// Push one client. The roster was read at job start, so the record is
    /// re-checked before the push and the assignment is only marked while
    /// it is still active; a client that lost that race is taken back off.
    async fn push_missing(&self, panel: &dyn PanelClient, server: &Server, sub: &Subscription) -> bool {
        match self.db.get_subscription(&sub.id).await {
            Ok(current) if current.status == SubscriptionStatus::Active => {}
            Ok(_) | Err(DatabaseError::NotFound(_)) => {
                debug!(server_id = server.id, subscription_id = %sub.id, "Subscription no longer active, skipping");
                return true;
            }
            Err(e) => {
                warn!(server_id = server.id, subscription_id = %sub.id, error = %e, "Cannot re-read subscription");
                return false;
            }
        }

        let spec = ClientSpec::for_subscription(sub, server.flow.as_deref());
        if let Err(e) = with_timeout(self.call_timeout, panel.add_client(&spec)).await {
            warn!(server_id = server.id, client_id = %sub.client_id, error = %e, "Sync push failed");
            return false;
        }

        match self.db.mark_provisioned_if_active(&sub.id, server.id).await {
            Ok(true) => true,
            Ok(false) => {
                info!(server_id = server.id, client_id = %sub.client_id, "Subscription ended during push, removing client");
                match with_timeout(self.call_timeout, panel.remove_client(&sub.client_id)).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(server_id = server.id, client_id = %sub.client_id, error = %e, "Failed to take back client");
                        false
                    }
                }
            }
            Err(e) => {
                warn!(server_id = server.id, subscription_id = %sub.id, error = %e, "Failed to record provisioned client");
                true
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::fleet::FleetDistributor;
    use crate::panel::RemoteClient;
    use crate::sweeper::ExpirationSweeper;
    use crate::test_helpers::{
        MockConnector, MockPanel, stored_server, stored_subscription, test_db,
    };

    fn manager(db: &FleetDatabase, connector: Arc<MockConnector>) -> SyncJobManager {
        SyncJobManager::new(db.clone(), connector, Duration::from_secs(5), 150)
    }

    async fn wait_terminal(manager: &SyncJobManager, server_id: i64) -> SyncJob {
        for _ in 0..500 {
            if let Some(job) = manager.poll(server_id) {
                if job.status.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sync job for server {server_id} did not finish");
    }

    #[tokio::test]
    async fn pushes_missing_clients_and_completes() {
        let db = test_db().await;
        let srv = stored_server(&db, "a").await;
        let s1 = stored_subscription(&db, "s1", 30).await;
        let s2 = stored_subscription(&db, "s2", 30).await;
        let s3 = stored_subscription(&db, "s3", 30).await;
        for sub in [&s1, &s2, &s3] {
            db.assign_servers(&sub.id, &[srv.id]).await.unwrap();
        }

        let connector = Arc::new(MockConnector::new());
        connector.set_panel(
            srv.id,
            MockPanel::healthy()
                .with_clients(vec![RemoteClient {
                    id: s1.client_id.clone(),
                    email: "old".into(),
                    enable: true,
                }])
                .failing_for(&s3.client_id),
        );
        let manager = manager(&db, connector.clone());

        let started = manager.start(srv.id).await.unwrap();
        assert_eq!(started.status, SyncJobStatus::Pending);
        assert_eq!(started.total, 3);
        assert_eq!(started.estimated_duration_ms, 450);

        let job = wait_terminal(&manager, srv.id).await;
        assert_eq!(job.status, SyncJobStatus::Completed);
        assert_eq!(job.total, 3);
        assert_eq!(job.success, 2);
        assert_eq!(job.failed, 1);
        assert_eq!(job.total, job.success + job.failed);
        assert_eq!(job.processed, job.total);
        assert!(job.error.is_none());
        assert!(job.completed_at.is_some());

        assert!(connector.panel(srv.id).has_client(&s2.client_id));
        assert_eq!(db.provisioned_server_ids(&s1.id).await.unwrap(), vec![srv.id]);
        assert_eq!(db.provisioned_server_ids(&s2.id).await.unwrap(), vec![srv.id]);
        assert!(db.provisioned_server_ids(&s3.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_panel_fails_job() {
        let db = test_db().await;
        let srv = stored_server(&db, "a").await;
        let connector = Arc::new(MockConnector::new());
        connector.set_panel(srv.id, MockPanel::unreachable());
        let manager = manager(&db, connector);

        manager.start(srv.id).await.unwrap();
        let job = wait_terminal(&manager, srv.id).await;
        assert_eq!(job.status, SyncJobStatus::Failed);
        assert!(job.error.as_deref().unwrap().contains("cannot list remote clients"));
    }

    #[tokio::test]
    async fn second_start_conflicts_and_leaves_job_untouched() {
        let db = test_db().await;
        let srv = stored_server(&db, "a").await;
        let sub = stored_subscription(&db, "s1", 30).await;
        db.assign_servers(&sub.id, &[srv.id]).await.unwrap();

        let connector = Arc::new(MockConnector::new());
        connector.set_panel(srv.id, MockPanel::healthy().with_delay(Duration::from_secs(30)));
        let manager = manager(&db, connector);

        let first = manager.start(srv.id).await.unwrap();
        let err = manager.start(srv.id).await.unwrap_err();
        assert!(matches!(err, FleetError::Conflict(_)));

        let current = manager.poll(srv.id).unwrap();
        assert!(!current.status.is_terminal());
        assert_eq!(current.started_at, first.started_at);
        assert_eq!(current.estimated_duration_ms, first.estimated_duration_ms);
        assert_eq!(current.total, 1);
        assert_eq!(current.processed, 0);

        assert!(matches!(manager.clear(srv.id), Err(FleetError::Conflict(_))));
    }

    #[tokio::test]
    async fn simultaneous_starts_create_one_job() {
        let db = test_db().await;
        let srv = stored_server(&db, "a").await;
        for id in ["s1", "s2"] {
            let sub = stored_subscription(&db, id, 30).await;
            db.assign_servers(&sub.id, &[srv.id]).await.unwrap();
        }

        let connector = Arc::new(MockConnector::new());
        connector.set_panel(srv.id, MockPanel::healthy().with_delay(Duration::from_secs(30)));
        let manager = manager(&db, connector);

        let (a, b) = tokio::join!(manager.start(srv.id), manager.start(srv.id));
        let (winner, loser) = match (a, b) {
            (Ok(job), Err(err)) | (Err(err), Ok(job)) => (job, err),
            (a, b) => panic!("expected exactly one start to win, got {a:?} and {b:?}"),
        };
        assert!(matches!(loser, FleetError::Conflict(_)));

        let current = manager.poll(srv.id).unwrap();
        assert!(!current.status.is_terminal());
        assert_eq!(current.started_at, winner.started_at);
        assert_eq!(current.total, winner.total);
        assert_eq!(current.total, 2);
        assert_eq!(current.estimated_duration_ms, winner.estimated_duration_ms);
        assert_eq!(current.processed, 0);
    }

    fn sweeper(db: &FleetDatabase, connector: Arc<MockConnector>) -> ExpirationSweeper {
        let distributor = Arc::new(FleetDistributor::new(connector, 4, Duration::from_secs(5)));
        ExpirationSweeper::new(db.clone(), Arc::new(db.clone()), distributor)
    }

    #[tokio::test]
    async fn sweep_while_listing_keeps_expired_client_off_panel() {
        let db = test_db().await;
        let srv = stored_server(&db, "a").await;
        let sub = stored_subscription(&db, "x", -1).await;
        db.assign_servers(&sub.id, &[srv.id]).await.unwrap();

        let connector = Arc::new(MockConnector::new());
        connector.set_panel(srv.id, MockPanel::healthy().with_delay(Duration::from_millis(300)));
        let manager = manager(&db, connector.clone());
        let sweeper = sweeper(&db, connector.clone());

        manager.start(srv.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sweeper.run().await.unwrap().expired_count, 1);

        let job = wait_terminal(&manager, srv.id).await;
        assert_eq!(job.status, SyncJobStatus::Completed);
        assert_eq!(job.processed, 1);
        assert_eq!(job.failed, 0);

        let panel = connector.panel(srv.id);
        assert!(panel.added().is_empty());
        assert!(!panel.has_client(&sub.client_id));
        assert!(db.provisioned_server_ids(&sub.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_during_push_takes_client_back() {
        let db = test_db().await;
        let srv = stored_server(&db, "a").await;
        let sub = stored_subscription(&db, "x", -1).await;
        db.assign_servers(&sub.id, &[srv.id]).await.unwrap();

        let connector = Arc::new(MockConnector::new());
        connector.set_panel(srv.id, MockPanel::healthy().with_delay(Duration::from_millis(300)));
        let manager = manager(&db, connector.clone());
        let sweeper = sweeper(&db, connector.clone());

        // Listing ends at ~300ms and the push at ~600ms.
        manager.start(srv.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(sweeper.run().await.unwrap().expired_count, 1);

        let job = wait_terminal(&manager, srv.id).await;
        assert_eq!(job.status, SyncJobStatus::Completed);

        let panel = connector.panel(srv.id);
        assert_eq!(panel.added().len(), 1);
        assert!(!panel.has_client(&sub.client_id));
        assert!(db.provisioned_server_ids(&sub.id).await.unwrap().is_empty());
        assert_eq!(
            db.get_subscription(&sub.id).await.unwrap().status,
            SubscriptionStatus::Expired
        );
    }

    #[tokio::test]
    async fn finished_job_can_be_cleared_or_superseded() {
        let db = test_db().await;
        let srv = stored_server(&db, "a").await;
        let manager = manager(&db, Arc::new(MockConnector::new()));

        manager.start(srv.id).await.unwrap();
        let done = wait_terminal(&manager, srv.id).await;
        assert_eq!(done.status, SyncJobStatus::Completed);
        assert_eq!(done.total, 0);

        // Polling is read-only.
        assert_eq!(manager.poll(srv.id).unwrap(), done);

        manager.start(srv.id).await.unwrap();
        wait_terminal(&manager, srv.id).await;

        manager.clear(srv.id).unwrap();
        assert!(manager.poll(srv.id).is_none());
        assert!(matches!(manager.clear(srv.id), Err(FleetError::NotFound(_))));
    }

    #[tokio::test]
    async fn unknown_server_is_not_found() {
        let db = test_db().await;
        let manager = manager(&db, Arc::new(MockConnector::new()));
        assert!(matches!(manager.start(42).await, Err(FleetError::NotFound(_))));
        assert!(manager.poll(42).is_none());
    }

    #[tokio::test]
    async fn job_serializes_kebab_status() {
        let job = SyncJob::pending(3, 100);
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["serverId"], 3);
        assert_eq!(json["estimatedDurationMs"], 100);

        let mut running = job;
        running.status = SyncJobStatus::InProgress;
        assert_eq!(serde_json::to_value(&running).unwrap()["status"], "in-progress");
    }
}
