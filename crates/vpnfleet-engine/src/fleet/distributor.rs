//! Bounded concurrent fan-out of panel calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::panel::{ClientSpec, PanelConnector, PanelError, with_timeout};
use crate::storage::Server;

/// Default number of panel calls in flight when none is configured.
const DEFAULT_PARALLELISM: usize = 8;

/// Outcome of one server's call within a fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerOutcome {
    pub server_id: i64,
    pub server_name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate of a fan-out; `servers_total == servers_success + servers_failed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetResult {
    pub servers_total: usize,
    pub servers_success: usize,
    pub servers_failed: usize,
    pub per_server: Vec<ServerOutcome>,
}

impl FleetResult {
    fn from_outcomes(mut per_server: Vec<ServerOutcome>) -> Self {
        per_server.sort_by_key(|o| o.server_id);
        let servers_success = per_server.iter().filter(|o| o.ok).count();
        Self {
            servers_total: per_server.len(),
            servers_success,
            servers_failed: per_server.len() - servers_success,
            per_server,
        }
    }

    /// IDs of servers where the call succeeded.
    pub fn succeeded(&self) -> impl Iterator<Item = i64> + '_ {
        self.per_server.iter().filter(|o| o.ok).map(|o| o.server_id)
    }

    /// Outcomes of servers where the call failed.
    pub fn failures(&self) -> impl Iterator<Item = &ServerOutcome> + '_ {
        self.per_server.iter().filter(|o| !o.ok)
    }
}

#[derive(Clone)]
enum FleetOp {
    Add(Arc<ClientSpec>),
    Remove(Arc<str>),
}

impl FleetOp {
    const fn name(&self) -> &'static str {
        match self {
            Self::Add(_) => "add",
            Self::Remove(_) => "remove",
        }
    }
}

/// Fans panel calls out to many servers with a shared concurrency bound.
pub struct FleetDistributor {
    connector: Arc<dyn PanelConnector>,
    semaphore: Arc<Semaphore>,
    call_timeout: Duration,
}

impl FleetDistributor {
    /// Create a distributor. A `parallelism` of 0 selects the default.
    pub fn new(connector: Arc<dyn PanelConnector>, parallelism: usize, call_timeout: Duration) -> Self {
        let limit = if parallelism == 0 {
            DEFAULT_PARALLELISM
        } else {
            parallelism
        };
        Self {
            connector,
            semaphore: Arc::new(Semaphore::new(limit)),
            call_timeout,
        }
    }

    /// Add the client to every target server.
    #[instrument(skip(self, spec, servers), fields(client_id = %spec.id, servers = servers.len()))]
    pub async fn distribute(&self, spec: &ClientSpec, servers: &[Server]) -> FleetResult {
        let result = self.fan_out(FleetOp::Add(Arc::new(spec.clone())), servers).await;
        info!(
            success = result.servers_success,
            failed = result.servers_failed,
            "Client distributed"
        );
        result
    }

    /// Remove the client from every target server.
    #[instrument(skip(self, servers), fields(servers = servers.len()))]
    pub async fn revoke(&self, client_id: &str, servers: &[Server]) -> FleetResult {
        let result = self.fan_out(FleetOp::Remove(Arc::from(client_id)), servers).await;
        info!(
            success = result.servers_success,
            failed = result.servers_failed,
            "Client revoked"
        );
        result
    }

    async fn fan_out(&self, op: FleetOp, servers: &[Server]) -> FleetResult {
        let mut tasks = JoinSet::new();
        let mut spawned = HashMap::with_capacity(servers.len());

        for server in servers {
            let server = server.clone();
            let op = op.clone();
            let connector = Arc::clone(&self.connector);
            let semaphore = Arc::clone(&self.semaphore);
            let limit = self.call_timeout;
            let identity = (server.id, server.name.clone());

            let handle = tasks.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => apply(connector.as_ref(), &server, &op, limit).await,
                    Err(_) => Err(PanelError::Config("fan-out pool closed".into())),
                };
                if let Err(e) = &outcome {
                    warn!(server_id = server.id, op = op.name(), error = %e, "Panel call failed");
                }
                outcome_for(server.id, server.name, outcome)
            });
            spawned.insert(handle.id(), identity);
        }

        let mut outcomes = Vec::with_capacity(servers.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    // A panicking call still counts as that server's failure.
                    if let Some((server_id, server_name)) = spawned.remove(&e.id()) {
                        warn!(server_id, error = %e, "Panel call task aborted");
                        outcomes.push(ServerOutcome {
                            server_id,
                            server_name,
                            ok: false,
                            error: Some(format!("task failed: {e}")),
                        });
                    }
                }
            }
        }

        debug!(op = op.name(), settled = outcomes.len(), "Fan-out settled");
        FleetResult::from_outcomes(outcomes)
    }
}

async fn apply(
    connector: &dyn PanelConnector,
    server: &Server,
    op: &FleetOp,
    limit: Duration,
) -> Result<(), PanelError> {
    let panel = connector.connect(server)?;
    match op {
        FleetOp::Add(spec) => {
            let mut spec = (**spec).clone();
            if spec.flow.is_empty() {
                spec.flow = server.flow.clone().unwrap_or_default();
            }
            with_timeout(limit, panel.add_client(&spec)).await
        }
        FleetOp::Remove(client_id) => with_timeout(limit, panel.remove_client(client_id)).await,
    }
}

fn outcome_for(server_id: i64, server_name: String, result: Result<(), PanelError>) -> ServerOutcome {
    match result {
        Ok(()) => ServerOutcome {
            server_id,
            server_name,
            ok: true,
            error: None,
        },
        Err(e) => ServerOutcome {
            server_id,
            server_name,
            ok: false,
            error: Some(e.to_string()),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_helpers::{MockConnector, MockPanel, server, subscription};

    fn spec() -> ClientSpec {
        ClientSpec::for_subscription(&subscription("s1", 30), None)
    }

    #[tokio::test]
    async fn all_servers_succeed() {
        let connector = Arc::new(MockConnector::new());
        let distributor = FleetDistributor::new(connector.clone(), 4, Duration::from_secs(5));
        let servers = vec![server(1), server(2), server(3)];

        let result = distributor.distribute(&spec(), &servers).await;
        assert_eq!(result.servers_total, 3);
        assert_eq!(result.servers_success, 3);
        assert_eq!(result.servers_failed, 0);
        for id in 1..=3 {
            assert!(connector.panel(id).has_client(&spec().id));
        }
    }

    #[tokio::test]
    async fn one_unreachable_server_is_isolated() {
        let connector = Arc::new(MockConnector::new());
        connector.set_panel(2, MockPanel::unreachable());
        let distributor = FleetDistributor::new(connector.clone(), 2, Duration::from_secs(5));
        let servers = vec![server(3), server(2), server(1)];

        let result = distributor.distribute(&spec(), &servers).await;
        assert_eq!(result.servers_total, 3);
        assert_eq!(result.servers_success, 2);
        assert_eq!(result.servers_failed, 1);
        assert_eq!(result.servers_total, result.servers_success + result.servers_failed);

        let ids: Vec<i64> = result.per_server.iter().map(|o| o.server_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(result.per_server[1].error.is_some());
        assert_eq!(result.succeeded().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_server_times_out() {
        let connector = Arc::new(MockConnector::new());
        connector.set_panel(1, MockPanel::healthy().with_delay(Duration::from_secs(60)));
        let distributor = FleetDistributor::new(connector, 4, Duration::from_secs(2));

        let result = distributor.distribute(&spec(), &[server(1), server(2)]).await;
        assert_eq!(result.servers_success, 1);
        let failure = result.failures().next().unwrap();
        assert_eq!(failure.server_id, 1);
        assert!(failure.error.as_deref().unwrap().contains("Timed out"));
    }

    #[tokio::test]
    async fn revoke_removes_client() {
        let connector = Arc::new(MockConnector::new());
        let distributor = FleetDistributor::new(connector.clone(), 4, Duration::from_secs(5));
        let servers = vec![server(1), server(2)];
        let spec = spec();

        distributor.distribute(&spec, &servers).await;
        let result = distributor.revoke(&spec.id, &servers).await;
        assert_eq!(result.servers_success, 2);
        assert!(!connector.panel(1).has_client(&spec.id));
    }

    #[tokio::test]
    async fn empty_target_set_is_empty_result() {
        let distributor =
            FleetDistributor::new(Arc::new(MockConnector::new()), 0, Duration::from_secs(1));
        let result = distributor.distribute(&spec(), &[]).await;
        assert_eq!(result, FleetResult::default());
    }

    #[tokio::test]
    async fn server_flow_fills_missing_flow() {
        let connector = Arc::new(MockConnector::new());
        let distributor = FleetDistributor::new(connector.clone(), 4, Duration::from_secs(5));
        let mut srv = server(1);
        srv.flow = Some("xtls-rprx-vision".into());

        distributor.distribute(&spec(), &[srv]).await;
        let added = connector.panel(1).added();
        assert_eq!(added[0].flow, "xtls-rprx-vision");
    }
}
