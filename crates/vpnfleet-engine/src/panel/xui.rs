//! 3x-ui style panel client.
//!
//! The panel authenticates with a JSON login that sets a session cookie and
//! wraps every API reply in a `{success, msg, obj}` envelope. Clients live
//! inside an inbound's `settings` document, which the panel transports as a
//! JSON-encoded string.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::StatusCode;
use reqwest::header::{COOKIE, SET_COOKIE};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use vpnfleet_core::config::PanelConfig;

use super::{ClientSpec, PanelClient, PanelConnector, PanelError, RemoteClient};
use crate::storage::Server;

/// API reply envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    obj: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct InboundSettings {
    #[serde(default)]
    clients: Vec<RemoteClient>,
}

/// Client for one server's panel and inbound.
pub struct XuiPanel {
    http: reqwest::Client,
    base_url: String,
    inbound_id: i64,
    username: String,
    password: String,
    session: Mutex<Option<String>>,
}

impl XuiPanel {
    pub fn new(http: reqwest::Client, server: &Server) -> Result<Self, PanelError> {
        if server.api_url.trim().is_empty() {
            return Err(PanelError::Config(format!("server {} has no API URL", server.id)));
        }
        Ok(Self {
            http,
            base_url: panel_base_url(&server.api_url, server.web_base_path.as_deref()),
            inbound_id: server.inbound_id,
            username: server.username.clone(),
            password: server.password.clone(),
            session: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn login(&self) -> Result<String, PanelError> {
        let resp = self
            .http
            .post(self.url("login"))
            .json(&json!({ "username": self.username, "password": self.password }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(PanelError::Auth(format!("login returned {}", resp.status())));
        }

        let cookie = session_cookie(resp.headers().get_all(SET_COOKIE).iter().filter_map(|v| v.to_str().ok()));
        let envelope: Envelope = resp
            .json()
            .await
            .map_err(|e| PanelError::Auth(format!("unreadable login reply: {e}")))?;
        if !envelope.success {
            return Err(PanelError::Auth(envelope.msg));
        }

        cookie.ok_or_else(|| PanelError::Auth("login set no session cookie".into()))
    }

    async fn session(&self) -> Result<String, PanelError> {
        let mut guard = self.session.lock().await;
        if let Some(cookie) = guard.as_ref() {
            return Ok(cookie.clone());
        }
        let cookie = self.login().await?;
        debug!(base_url = %self.base_url, "Panel session established");
        *guard = Some(cookie.clone());
        Ok(cookie)
    }

    async fn send_once(&self, path: &str, body: Option<&Value>) -> Result<Envelope, PanelError> {
        let cookie = self.session().await?;
        let request = match body {
            Some(body) => self.http.post(self.url(path)).json(body),
            None => self.http.get(self.url(path)),
        };
        let resp = request.header(COOKIE, cookie).send().await?;

        let status = resp.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(PanelError::Auth(format!("{path} returned {status}")));
        }
        if !status.is_success() {
            return Err(PanelError::Remote(format!("{path} returned {status}")));
        }

        resp.json()
            .await
            .map_err(|e| PanelError::Remote(format!("unreadable reply from {path}: {e}")))
    }

    /// Call an API endpoint, re-authenticating once if the session expired.
    async fn call(&self, path: &str, body: Option<&Value>) -> Result<Option<Value>, PanelError> {
        let envelope = match self.send_once(path, body).await {
            Err(PanelError::Auth(reason)) => {
                warn!(base_url = %self.base_url, %reason, "Panel session rejected, logging in again");
                *self.session.lock().await = None;
                self.send_once(path, body).await?
            }
            other => other?,
        };

        if !envelope.success {
            return Err(PanelError::Remote(envelope.msg));
        }
        Ok(envelope.obj)
    }

    fn client_payload(&self, spec: &ClientSpec) -> Result<Value, PanelError> {
        let settings = serde_json::to_string(&json!({ "clients": [spec] }))
            .map_err(|e| PanelError::Config(e.to_string()))?;
        Ok(json!({ "id": self.inbound_id, "settings": settings }))
    }
}

#[async_trait]
impl PanelClient for XuiPanel {
    async fn add_client(&self, spec: &ClientSpec) -> Result<(), PanelError> {
        let payload = self.client_payload(spec)?;
        self.call("panel/api/inbounds/addClient", Some(&payload)).await?;
        Ok(())
    }

    async fn remove_client(&self, client_id: &str) -> Result<(), PanelError> {
        let path = format!("panel/api/inbounds/{}/delClient/{client_id}", self.inbound_id);
        self.call(&path, Some(&json!({}))).await?;
        Ok(())
    }

    async fn list_clients(&self) -> Result<Vec<RemoteClient>, PanelError> {
        let path = format!("panel/api/inbounds/get/{}", self.inbound_id);
        let inbound = self
            .call(&path, None)
            .await?
            .ok_or_else(|| PanelError::Remote(format!("inbound {} not found", self.inbound_id)))?;
        parse_inbound_clients(&inbound)
    }

    async fn update_client(&self, spec: &ClientSpec) -> Result<(), PanelError> {
        let payload = self.client_payload(spec)?;
        let path = format!("panel/api/inbounds/updateClient/{}", spec.id);
        self.call(&path, Some(&payload)).await?;
        Ok(())
    }
}

/// Server fields a panel session depends on. Anything else on the record
/// can change without dropping the session.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PanelKey {
    api_url: String,
    web_base_path: Option<String>,
    username: String,
    password: String,
    inbound_id: i64,
}

impl PanelKey {
    fn of(server: &Server) -> Self {
        Self {
            api_url: server.api_url.clone(),
            web_base_path: server.web_base_path.clone(),
            username: server.username.clone(),
            password: server.password.clone(),
            inbound_id: server.inbound_id,
        }
    }
}

/// Connector that shares one HTTP client across all panels and reuses
/// per-server sessions until the server's connection settings change.
pub struct XuiConnector {
    http: reqwest::Client,
    clients: DashMap<i64, (PanelKey, Arc<XuiPanel>)>,
}

impl XuiConnector {
    pub fn new(config: &PanelConfig) -> Result<Self, PanelError> {
        // reqwest is built without a default crypto provider; an `Err` here
        // only means one is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;

        Ok(Self {
            http,
            clients: DashMap::new(),
        })
    }
}

impl PanelConnector for XuiConnector {
    fn connect(&self, server: &Server) -> Result<Arc<dyn PanelClient>, PanelError> {
        let key = PanelKey::of(server);
        if let Some(entry) = self.clients.get(&server.id) {
            let (cached, panel) = entry.value();
            if *cached == key {
                return Ok(panel.clone());
            }
        }

        debug!(server_id = server.id, "Opening panel session");
        let panel = Arc::new(XuiPanel::new(self.http.clone(), server)?);
        self.clients.insert(server.id, (key, panel.clone()));
        Ok(panel)
    }
}

/// `<apiUrl>/<webBasePath>` without duplicate or trailing slashes.
fn panel_base_url(api_url: &str, web_base_path: Option<&str>) -> String {
    let root = api_url.trim().trim_end_matches('/');
    match web_base_path.map(|p| p.trim().trim_matches('/')) {
        Some(path) if !path.is_empty() => format!("{root}/{path}"),
        _ => root.to_string(),
    }
}

/// Join the `name=value` parts of `Set-Cookie` headers into a `Cookie` value.
fn session_cookie<'a>(headers: impl Iterator<Item = &'a str>) -> Option<String> {
    let pairs: Vec<&str> = headers
        .filter_map(|h| h.split(';').next())
        .map(str::trim)
        .filter(|pair| pair.contains('=') && !pair.ends_with('='))
        .collect();
    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join("; "))
    }
}

/// Extract the client list from an inbound object whose `settings` field is
/// a JSON document encoded as a string.
fn parse_inbound_clients(inbound: &Value) -> Result<Vec<RemoteClient>, PanelError> {
    let settings = match inbound.get("settings") {
        Some(Value::String(raw)) => serde_json::from_str::<InboundSettings>(raw),
        Some(other) => serde_json::from_value::<InboundSettings>(other.clone()),
        None => return Ok(Vec::new()),
    }
    .map_err(|e| PanelError::Remote(format!("malformed inbound settings: {e}")))?;

    Ok(settings.clients)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_helpers::server;

    #[test]
    fn connector_reuses_session_until_connection_settings_change() {
        let connector = XuiConnector::new(&PanelConfig::default()).unwrap();
        let original = server(1);
        let first = connector.connect(&original).unwrap();

        let mut renamed = original.clone();
        renamed.name = "renamed".into();
        renamed.public_port = 8443;
        assert!(Arc::ptr_eq(&first, &connector.connect(&renamed).unwrap()));

        // Same second, new password: the cached session must not be reused.
        let mut fixed = renamed.clone();
        fixed.password = "fixed".into();
        assert_eq!(fixed.updated_at, original.updated_at);
        let second = connector.connect(&fixed).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&second, &connector.connect(&fixed).unwrap()));

        let mut moved = fixed.clone();
        moved.inbound_id = 7;
        assert!(!Arc::ptr_eq(&second, &connector.connect(&moved).unwrap()));
    }

    #[test]
    fn base_url_joins_path() {
        assert_eq!(
            panel_base_url("https://p.example:2053/", Some("/dash/")),
            "https://p.example:2053/dash"
        );
        assert_eq!(panel_base_url("https://p.example", None), "https://p.example");
        assert_eq!(panel_base_url("https://p.example", Some("  ")), "https://p.example");
    }

    #[test]
    fn session_cookie_keeps_name_value_pairs() {
        let headers = [
            "3x-ui=MTcw; Path=/; HttpOnly",
            "lang=en-US; Path=/",
            "deleted=; Max-Age=0",
        ];
        assert_eq!(
            session_cookie(headers.into_iter()).as_deref(),
            Some("3x-ui=MTcw; lang=en-US")
        );
        assert!(session_cookie(std::iter::empty()).is_none());
    }

    #[test]
    fn parses_string_encoded_settings() {
        let inbound = json!({
            "id": 1,
            "settings": "{\"clients\":[{\"id\":\"a\",\"email\":\"sub-a\",\"enable\":true},{\"id\":\"b\"}]}"
        });
        let clients = parse_inbound_clients(&inbound).unwrap();
        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0].email, "sub-a");
        assert_eq!(clients[1].id, "b");
        assert!(clients[1].enable);
    }

    #[test]
    fn parses_object_settings_and_missing_settings() {
        let inbound = json!({ "settings": { "clients": [{ "id": "x", "enable": false }] } });
        let clients = parse_inbound_clients(&inbound).unwrap();
        assert!(!clients[0].enable);

        assert!(parse_inbound_clients(&json!({ "id": 3 })).unwrap().is_empty());
    }

    #[test]
    fn malformed_settings_is_remote_error() {
        let inbound = json!({ "settings": "{not json" });
        assert!(matches!(
            parse_inbound_clients(&inbound),
            Err(PanelError::Remote(_))
        ));
    }

    #[test]
    fn envelope_tolerates_missing_fields() {
        let env: Envelope = serde_json::from_str(r#"{"success":false}"#).unwrap();
        assert!(!env.success);
        assert!(env.msg.is_empty());
        assert!(env.obj.is_none());
    }
}
