//! Telegram Bot API sender.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use vpnfleet_core::config::TelegramConfig;

use super::{MessageSender, MessagingError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct BotReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Sends messages through `POST <api>/bot<token>/sendMessage`.
///
/// Without a bot token every send fails with [`MessagingError::Config`].
#[derive(Debug)]
pub struct TelegramSender {
    http: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl TelegramSender {
    pub fn new(config: &TelegramConfig) -> Result<Self, MessagingError> {
        // An `Err` only means a provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let token = config.bot_token.clone().filter(|t| !t.is_empty());

        debug!(api_base = %config.api_base, has_token = token.is_some(), "Telegram sender initialized");

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn send_url(&self, token: &str) -> String {
        format!("{}/bot{token}/sendMessage", self.api_base)
    }
}

#[async_trait]
impl MessageSender for TelegramSender {
    async fn send(&self, chat_id: &str, text: &str) -> Result<(), MessagingError> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| MessagingError::Config("bot token is not set".into()))?;

        let resp = self
            .http
            .post(self.send_url(token))
            .json(&SendMessage { chat_id, text })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let body = serde_json::from_str::<BotReply>(&body)
                .ok()
                .and_then(|r| r.description)
                .unwrap_or(body);
            return Err(MessagingError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let reply: BotReply = resp.json().await?;
        if reply.ok {
            Ok(())
        } else {
            Err(MessagingError::Rejected(
                reply.description.unwrap_or_else(|| "unknown reason".into()),
            ))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn url_includes_token() {
        let sender = TelegramSender::new(&TelegramConfig {
            bot_token: Some("123:abc".into()),
            api_base: "https://api.telegram.org/".into(),
        })
        .unwrap();
        assert_eq!(
            sender.send_url("123:abc"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
    }

    #[test]
    fn payload_uses_bot_api_names() {
        let json = serde_json::to_value(SendMessage { chat_id: "42", text: "hi" }).unwrap();
        assert_eq!(json, serde_json::json!({ "chat_id": "42", "text": "hi" }));
    }

    #[tokio::test]
    async fn missing_token_is_config_error() {
        let sender = TelegramSender::new(&TelegramConfig::default()).unwrap();
        assert!(matches!(
            sender.send("42", "hello").await,
            Err(MessagingError::Config(_))
        ));
    }
}
