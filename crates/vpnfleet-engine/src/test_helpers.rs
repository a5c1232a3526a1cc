//! Shared test utilities: in-process panel and messaging mocks plus record
//! builders.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::messaging::{MessageSender, MessagingError};
use crate::panel::{ClientSpec, PanelClient, PanelConnector, PanelError, RemoteClient};
use crate::storage::{
    FleetDatabase, NewServer, NewSubscription, Server, ServerStatus, Subscription, SubscriptionSource,
    SubscriptionStatus,
};
use vpnfleet_core::db::{SECS_PER_DAY, unix_timestamp};

// =========================================================================
// Panel mocks
// =========================================================================

/// In-memory panel with configurable failure modes.
#[derive(Default)]
pub struct MockPanel {
    clients: Mutex<Vec<RemoteClient>>,
    added: Mutex<Vec<ClientSpec>>,
    updated: Mutex<Vec<ClientSpec>>,
    unreachable: bool,
    failing: HashSet<String>,
    delay: Option<Duration>,
}

impl MockPanel {
    pub fn healthy() -> Self {
        Self::default()
    }

    /// Every call fails with a network error.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Add and update calls for this client id are rejected.
    pub fn failing_for(mut self, client_id: &str) -> Self {
        self.failing.insert(client_id.to_string());
        self
    }

    pub fn with_clients(self, clients: Vec<RemoteClient>) -> Self {
        *self.clients.lock().unwrap() = clients;
        self
    }

    pub fn has_client(&self, client_id: &str) -> bool {
        self.clients.lock().unwrap().iter().any(|c| c.id == client_id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn added(&self) -> Vec<ClientSpec> {
        self.added.lock().unwrap().clone()
    }

    pub fn updated(&self) -> Vec<ClientSpec> {
        self.updated.lock().unwrap().clone()
    }

    async fn gate(&self) -> Result<(), PanelError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable {
            return Err(PanelError::Network("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PanelClient for MockPanel {
    async fn add_client(&self, spec: &ClientSpec) -> Result<(), PanelError> {
        self.gate().await?;
        if self.failing.contains(&spec.id) {
            return Err(PanelError::Remote(format!("duplicate email {}", spec.email)));
        }
        self.added.lock().unwrap().push(spec.clone());
        let mut clients = self.clients.lock().unwrap();
        if !clients.iter().any(|c| c.id == spec.id) {
            clients.push(RemoteClient {
                id: spec.id.clone(),
                email: spec.email.clone(),
                enable: spec.enable,
            });
        }
        Ok(())
    }

    async fn remove_client(&self, client_id: &str) -> Result<(), PanelError> {
        self.gate().await?;
        self.clients.lock().unwrap().retain(|c| c.id != client_id);
        Ok(())
    }

    async fn list_clients(&self) -> Result<Vec<RemoteClient>, PanelError> {
        self.gate().await?;
        Ok(self.clients.lock().unwrap().clone())
    }

    async fn update_client(&self, spec: &ClientSpec) -> Result<(), PanelError> {
        self.gate().await?;
        if self.failing.contains(&spec.id) {
            return Err(PanelError::Remote("update rejected".into()));
        }
        self.updated.lock().unwrap().push(spec.clone());
        for client in self.clients.lock().unwrap().iter_mut() {
            if client.id == spec.id {
                client.email.clone_from(&spec.email);
            }
        }
        Ok(())
    }
}

/// Connector handing out one [`MockPanel`] per server id; unknown servers
/// get a healthy panel.
#[derive(Default)]
pub struct MockConnector {
    panels: DashMap<i64, Arc<MockPanel>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_panel(&self, server_id: i64, panel: MockPanel) {
        self.panels.insert(server_id, Arc::new(panel));
    }

    pub fn panel(&self, server_id: i64) -> Arc<MockPanel> {
        self.panels
            .entry(server_id)
            .or_insert_with(|| Arc::new(MockPanel::healthy()))
            .clone()
    }
}

impl PanelConnector for MockConnector {
    fn connect(&self, server: &Server) -> Result<Arc<dyn PanelClient>, PanelError> {
        Ok(self.panel(server.id))
    }
}

// =========================================================================
// Messaging mock
// =========================================================================

/// Records sends; chats in `failing` are rejected.
#[derive(Default)]
pub struct MockSender {
    sent: Mutex<Vec<(String, String)>>,
    failing: HashSet<String>,
}

impl MockSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(mut self, chat_id: &str) -> Self {
        self.failing.insert(chat_id.to_string());
        self
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSender for MockSender {
    async fn send(&self, chat_id: &str, text: &str) -> Result<(), MessagingError> {
        if self.failing.contains(chat_id) {
            return Err(MessagingError::Rejected(format!("chat {chat_id} blocked the bot")));
        }
        self.sent
            .lock()
            .unwrap()
            .push((chat_id.to_string(), text.to_string()));
        Ok(())
    }
}

// =========================================================================
// Record builders
// =========================================================================

/// A detached server record (not stored).
pub fn server(id: i64) -> Server {
    Server {
        id,
        name: format!("srv-{id}"),
        api_url: format!("https://panel-{id}.example"),
        web_base_path: None,
        username: "admin".into(),
        password: "secret".into(),
        inbound_id: 1,
        public_host: format!("srv-{id}.example"),
        public_port: 443,
        security: "reality".into(),
        pbk: Some("PBK".into()),
        fp: Some("chrome".into()),
        sni: Some("www.google.com".into()),
        sid: Some("6ba8".into()),
        spx: Some("/".into()),
        flow: None,
        users_limit: 100,
        status: ServerStatus::Active,
        pool_id: None,
        created_at: 0,
        updated_at: 0,
    }
}

/// A detached active subscription ending `days` from now (negative for the
/// past).
pub fn subscription(id: &str, days: i64) -> Subscription {
    let now = unix_timestamp();
    Subscription {
        id: id.to_string(),
        client_id: format!("{id}-0000-1111-2222-333333333333"),
        owner_ref: None,
        status: SubscriptionStatus::Active,
        source: SubscriptionSource::Admin,
        note: None,
        start_date: now,
        end_date: now + days * SECS_PER_DAY,
        period_days: days.abs(),
        device_limit: 1,
        traffic_limit: None,
        created_at: now,
        updated_at: now,
    }
}

pub async fn test_db() -> FleetDatabase {
    FleetDatabase::open_in_memory().await.unwrap()
}

/// Store an active server named `name`.
pub async fn stored_server(db: &FleetDatabase, name: &str) -> Server {
    db.create_server(&NewServer {
        name: name.to_string(),
        api_url: format!("https://{name}.panel.example"),
        web_base_path: None,
        username: "admin".into(),
        password: "secret".into(),
        inbound_id: 1,
        public_host: format!("{name}.example"),
        public_port: 443,
        security: "reality".into(),
        pbk: Some("PBK".into()),
        fp: Some("chrome".into()),
        sni: Some("www.google.com".into()),
        sid: Some("6ba8".into()),
        spx: Some("/".into()),
        flow: None,
        users_limit: 100,
        status: ServerStatus::Active,
        pool_id: None,
    })
    .await
    .unwrap()
}

/// Store an active subscription ending `days` from now (negative for the
/// past).
pub async fn stored_subscription(db: &FleetDatabase, id: &str, days: i64) -> Subscription {
    let template = subscription(id, days);
    db.create_subscription(&NewSubscription {
        id: &template.id,
        client_id: &template.client_id,
        owner_ref: None,
        source: SubscriptionSource::Admin,
        note: None,
        start_date: template.start_date,
        end_date: template.end_date,
        period_days: template.period_days,
        device_limit: 1,
        traffic_limit: None,
    })
    .await
    .unwrap()
}
