//! Recipient (bot user) queries for the vpnfleet engine.

use serde::Deserialize;
use vpnfleet_core::db::{DatabaseError, unix_timestamp};

use super::db::FleetDatabase;
use super::models::Recipient;

/// Parameters for registering a recipient.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRecipient {
    pub telegram_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
}

impl FleetDatabase {
    /// Register a recipient, or refresh the profile of a known one (which
    /// also reactivates it).
    pub async fn upsert_recipient(&self, params: &NewRecipient) -> Result<Recipient, DatabaseError> {
        sqlx::query(
            "INSERT INTO recipients (telegram_id, username, first_name, is_active, created_at) VALUES (?, ?, ?, 1, ?) \
             ON CONFLICT (telegram_id) DO UPDATE SET username = excluded.username, first_name = excluded.first_name, is_active = 1",
        )
        .bind(&params.telegram_id)
        .bind(&params.username)
        .bind(&params.first_name)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        self.get_recipient_by_telegram_id(&params.telegram_id).await
    }

    /// Get a recipient by its Telegram ID.
    pub async fn get_recipient_by_telegram_id(
        &self,
        telegram_id: &str,
    ) -> Result<Recipient, DatabaseError> {
        sqlx::query_as::<_, Recipient>("SELECT * FROM recipients WHERE telegram_id = ?")
            .bind(telegram_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Recipient {telegram_id}")))
    }

    /// List recipients, optionally only active ones.
    pub async fn list_recipients(&self, active_only: bool) -> Result<Vec<Recipient>, DatabaseError> {
        let recipients = if active_only {
            sqlx::query_as::<_, Recipient>("SELECT * FROM recipients WHERE is_active = 1 ORDER BY id")
                .fetch_all(self.pool())
                .await?
        } else {
            sqlx::query_as::<_, Recipient>("SELECT * FROM recipients ORDER BY id")
                .fetch_all(self.pool())
                .await?
        };

        Ok(recipients)
    }

    /// Stop sending broadcasts to a recipient.
    pub async fn deactivate_recipient(&self, telegram_id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE recipients SET is_active = 0 WHERE telegram_id = ?")
            .bind(telegram_id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
