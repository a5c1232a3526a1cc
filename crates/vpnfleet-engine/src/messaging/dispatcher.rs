//! Single-recipient and broadcast message dispatch.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::task::TaskTracker;
use tracing::{error, info, instrument, warn};

use super::MessageSender;
use crate::error::FleetError;
use crate::storage::RosterSource;

/// Outcome counts of a synchronous send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SendResult {
    pub sent: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// What the caller gets back from [`MessagingDispatcher::send`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SendOutcome {
    /// Sent to a single recipient before returning.
    Delivered(SendResult),
    /// Broadcast started in the background.
    Accepted,
}

pub struct MessagingDispatcher {
    sender: Arc<dyn MessageSender>,
    roster: Arc<dyn RosterSource>,
    pacing: Duration,
    tracker: TaskTracker,
}

impl MessagingDispatcher {
    pub fn new(sender: Arc<dyn MessageSender>, roster: Arc<dyn RosterSource>, pacing: Duration) -> Self {
        Self {
            sender,
            roster,
            pacing,
            tracker: TaskTracker::new(),
        }
    }

    /// Send `text` to one recipient, or broadcast it to every active
    /// recipient when `recipient` is `None`.
    #[instrument(skip(self, text), fields(len = text.len()))]
    pub async fn send(&self, text: &str, recipient: Option<&str>) -> Result<SendOutcome, FleetError> {
        if text.trim().is_empty() {
            return Err(FleetError::Validation("message text is empty".into()));
        }

        let Some(recipient) = recipient else {
            self.spawn_broadcast(text.to_string());
            return Ok(SendOutcome::Accepted);
        };
        if recipient.trim().is_empty() {
            return Err(FleetError::Validation("recipient id is empty".into()));
        }

        let mut result = SendResult::default();
        match self.sender.send(recipient, text).await {
            Ok(()) => result.sent = 1,
            Err(e) => {
                warn!(recipient, error = %e, "Message not delivered");
                result.failed = 1;
                result.errors.push(format!("{recipient}: {e}"));
            }
        }
        Ok(SendOutcome::Delivered(result))
    }

    fn spawn_broadcast(&self, text: String) {
        let sender = Arc::clone(&self.sender);
        let roster = Arc::clone(&self.roster);
        let pacing = self.pacing;

        self.tracker.spawn(async move {
            let recipients = match roster.all_recipients().await {
                Ok(r) => r,
                Err(e) => {
                    error!(error = %e, "Broadcast aborted: cannot load recipients");
                    return;
                }
            };

            let mut sent = 0usize;
            let mut failed = 0usize;
            for (i, chat_id) in recipients.iter().enumerate() {
                if i > 0 && !pacing.is_zero() {
                    tokio::time::sleep(pacing).await;
                }
                match sender.send(chat_id, &text).await {
                    Ok(()) => sent += 1,
                    Err(e) => {
                        failed += 1;
                        warn!(recipient = %chat_id, error = %e, "Broadcast message not delivered");
                    }
                }
            }
            info!(recipients = recipients.len(), sent, failed, "Broadcast finished");
        });
    }

    /// Wait for in-flight broadcasts to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
