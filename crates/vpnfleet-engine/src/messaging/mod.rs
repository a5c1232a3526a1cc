//! Notification messaging.
//!
//! A message goes either to one recipient, synchronously, or to the whole
//! recipient roster as a detached background broadcast whose per-recipient
//! outcomes only reach the log.

mod dispatcher;
mod telegram;

use async_trait::async_trait;

pub use dispatcher::{MessagingDispatcher, SendOutcome, SendResult};
pub use telegram::TelegramSender;

/// Errors from a message transport.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// Transport is not configured (e.g. missing bot token).
    #[error("Messaging not configured: {0}")]
    Config(String),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    /// The API accepted the request but refused to deliver.
    #[error("Message rejected: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for MessagingError {
    fn from(e: reqwest::Error) -> Self {
        Self::Request(e.to_string())
    }
}

/// Delivers a text message to one chat.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, chat_id: &str, text: &str) -> Result<(), MessagingError>;
}
