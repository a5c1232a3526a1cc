//! Data models for vpnfleet storage.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Suspended,
    Cancelled,
}

impl SubscriptionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Suspended => "suspended",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who created a subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SubscriptionSource {
    #[default]
    Admin,
    Bot,
}

impl SubscriptionSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Bot => "bot",
        }
    }
}

/// Operational state of a proxy server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ServerStatus {
    #[default]
    Active,
    Failed,
    Maintenance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    /// VPN credential key; unique across all subscriptions.
    pub client_id: String,
    pub owner_ref: Option<String>,
    pub status: SubscriptionStatus,
    pub source: SubscriptionSource,
    pub note: Option<String>,
    pub start_date: i64,
    pub end_date: i64,
    pub period_days: i64,
    pub device_limit: i64,
    pub traffic_limit: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub api_url: String,
    pub web_base_path: Option<String>,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub inbound_id: i64,
    pub public_host: String,
    pub public_port: i64,
    pub security: String,
    pub pbk: Option<String>,
    pub fp: Option<String>,
    pub sni: Option<String>,
    pub sid: Option<String>,
    pub spx: Option<String>,
    pub flow: Option<String>,
    pub users_limit: i64,
    pub status: ServerStatus,
    pub pool_id: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ServerPool {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A bot user that can receive notifications.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub id: i64,
    pub telegram_id: String,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub is_active: bool,
    pub created_at: i64,
}

/// Subscription counters for the dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStats {
    pub total: i64,
    pub active: i64,
    pub expired: i64,
}
