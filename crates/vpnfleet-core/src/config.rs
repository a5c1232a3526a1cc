//! Configuration resolution for vpnfleet.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/vpnfleet/settings.json) or an explicit file
//! 3. Environment variables
//! 4. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete vpnfleet configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub panel: PanelConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub subscription: SubscriptionConfig,
}

/// Fan-out, sync and sweep tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of panel calls in flight for one fan-out.
    pub fanout_parallelism: usize,
    /// Timeout applied to every outbound panel call (seconds).
    pub call_timeout_secs: u64,
    /// Estimated cost of pushing one client during a sync job (milliseconds).
    pub sync_per_client_ms: u64,
    /// Interval between background expiration sweeps (seconds). 0 disables.
    pub sweep_interval_secs: u64,
    /// Delay between consecutive broadcast sends (milliseconds).
    pub broadcast_pacing_ms: u64,
    pub database_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fanout_parallelism: 8,
            call_timeout_secs: 15,
            sync_per_client_ms: 150,
            sweep_interval_secs: 3600,
            broadcast_pacing_ms: 50,
            database_path: None,
        }
    }
}

/// Remote panel HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub request_timeout_secs: u64,
    /// Panels are commonly deployed with self-signed certificates.
    pub accept_invalid_certs: bool,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
            accept_invalid_certs: false,
        }
    }
}

/// Telegram bot settings for the messaging dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub api_base: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: "https://api.telegram.org".to_string(),
        }
    }
}

/// Subscription defaults and link generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Base URL subscription links are served from.
    pub public_base_url: String,
    /// Device limit for subscriptions created without one.
    pub default_device_limit: i64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            public_base_url: "http://localhost:3000".to_string(),
            default_device_limit: 1,
        }
    }
}

/// Load configuration with hierarchical resolution.
///
/// An explicit `path` replaces the global config location; it is an error
/// for an explicit path not to exist.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(p) => load_config_file(p)?,
        None => match global_config_path() {
            Some(global) if global.exists() => load_config_file(&global)?,
            _ => Config::default(),
        },
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs_config_root().map(|p| p.join("vpnfleet").join("settings.json"))
}

/// Get the default database path for the engine.
pub fn database_path() -> Option<PathBuf> {
    dirs_config_root().map(|p| p.join("vpnfleet").join("fleet.db"))
}

fn dirs_config_root() -> Option<PathBuf> {
    dirs::config_dir()
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("VPNFLEET_FANOUT_PARALLELISM") {
        if let Ok(n) = val.parse() {
            config.engine.fanout_parallelism = n;
        }
    }
    if let Ok(val) = std::env::var("VPNFLEET_CALL_TIMEOUT_SECS") {
        if let Ok(n) = val.parse() {
            config.engine.call_timeout_secs = n;
        }
    }
    if let Ok(val) = std::env::var("VPNFLEET_SWEEP_INTERVAL_SECS") {
        if let Ok(n) = val.parse() {
            config.engine.sweep_interval_secs = n;
        }
    }
    if let Ok(val) = std::env::var("VPNFLEET_TELEGRAM_BOT_TOKEN") {
        config.telegram.bot_token = Some(val);
    }
    if let Ok(val) = std::env::var("VPNFLEET_PUBLIC_BASE_URL") {
        config.subscription.public_base_url = val;
    }
}
