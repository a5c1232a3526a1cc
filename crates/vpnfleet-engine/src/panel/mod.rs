//! Remote panel integration.
//!
//! Every proxy server is administered through its own web panel. The engine
//! only needs four capabilities from it (add, remove, list and update
//! clients of one inbound), expressed by [`PanelClient`]. A [`PanelConnector`]
//! turns a stored [`Server`] record into a client, which keeps the fan-out
//! code independent of the HTTP details and lets tests plug in mocks.

mod xui;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{Server, Subscription};

pub use xui::{XuiConnector, XuiPanel};

/// Panel client errors, classified so callers can tell a dead server from a
/// rejected request.
#[derive(Debug, Clone, Error)]
pub enum PanelError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Panel rejected request: {0}")]
    Remote(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for PanelError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// Credential pushed to a panel for one subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSpec {
    pub id: String,
    /// Human-readable label; panels require it to be unique per inbound.
    pub email: String,
    pub limit_ip: i64,
    /// Traffic ceiling in bytes, 0 for unlimited.
    #[serde(rename = "totalGB")]
    pub total_gb: i64,
    /// Expiry as Unix milliseconds.
    pub expiry_time: i64,
    pub enable: bool,
    #[serde(default)]
    pub flow: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tg_id: String,
}

impl ClientSpec {
    /// Build the credential for a subscription. `flow` is the transport flow
    /// of the target server, if any.
    pub fn for_subscription(sub: &Subscription, flow: Option<&str>) -> Self {
        Self {
            id: sub.client_id.clone(),
            email: canonical_label(&sub.client_id, sub.owner_ref.as_deref()),
            limit_ip: sub.device_limit,
            total_gb: sub.traffic_limit.unwrap_or(0),
            expiry_time: sub.end_date.saturating_mul(1000),
            enable: true,
            flow: flow.unwrap_or_default().to_string(),
            tg_id: sub.owner_ref.clone().unwrap_or_default(),
        }
    }
}

/// Canonical client label: `sub-<first 8 chars of client id>`, with the
/// owner reference appended when present.
pub fn canonical_label(client_id: &str, owner_ref: Option<&str>) -> String {
    let short: String = client_id.chars().take(8).collect();
    match owner_ref.filter(|o| !o.is_empty()) {
        Some(owner) => format!("sub-{short}-{owner}"),
        None => format!("sub-{short}"),
    }
}

/// A client as reported by a panel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteClient {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default = "default_enable")]
    pub enable: bool,
}

const fn default_enable() -> bool {
    true
}

/// Per-server client management.
#[async_trait]
pub trait PanelClient: Send + Sync {
    async fn add_client(&self, spec: &ClientSpec) -> Result<(), PanelError>;

    async fn remove_client(&self, client_id: &str) -> Result<(), PanelError>;

    async fn list_clients(&self) -> Result<Vec<RemoteClient>, PanelError>;

    /// Replace the client identified by `spec.id`.
    async fn update_client(&self, spec: &ClientSpec) -> Result<(), PanelError>;
}

/// Builds a [`PanelClient`] for a server record.
pub trait PanelConnector: Send + Sync {
    fn connect(&self, server: &Server) -> Result<Arc<dyn PanelClient>, PanelError>;
}

/// Run a panel call with a deadline.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, PanelError>
where
    F: Future<Output = Result<T, PanelError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| PanelError::Timeout(limit))?
}
