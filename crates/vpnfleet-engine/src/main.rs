//! `vpnfleet` engine daemon
//!
//! Serves the JSON API for subscription provisioning and fleet
//! synchronization, and runs the scheduled expiration sweep.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use vpnfleet_engine::api::{AppState, build_router};
use vpnfleet_engine::messaging::TelegramSender;
use vpnfleet_engine::panel::XuiConnector;
use vpnfleet_engine::storage::FleetDatabase;

#[derive(Parser, Debug)]
#[command(name = "vpnfleetd")]
#[command(version, about = "vpnfleet engine - subscription provisioning for a proxy fleet")]
struct Args {
    /// HTTP bind address
    #[arg(long, default_value = "127.0.0.1:3000", env = "VPNFLEET_ADDR")]
    addr: SocketAddr,

    /// Config file path (defaults to ~/.config/vpnfleet/settings.json)
    #[arg(long, env = "VPNFLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Database file path
    #[arg(long, env = "VPNFLEET_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Log level filter for the engine (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "VPNFLEET_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "VPNFLEET_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("vpnfleet_engine={},tower_http=info", args.log_level);
    vpnfleet_core::tracing_init::init_tracing(&log_filter, args.log_json);

    let config = vpnfleet_core::config::load_config(args.config.as_deref())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %args.addr,
        fanout_parallelism = config.engine.fanout_parallelism,
        "Starting vpnfleetd"
    );

    let db_path = args
        .db_path
        .or_else(|| config.engine.database_path.clone())
        .or_else(vpnfleet_core::config::database_path)
        .ok_or_else(|| anyhow::anyhow!("Cannot determine database path"))?;
    info!(path = %db_path.display(), "Opening database");
    let db = FleetDatabase::open(&db_path).await?;

    let connector = Arc::new(XuiConnector::new(&config.panel)?);
    let sender = Arc::new(TelegramSender::new(&config.telegram)?);
    let state = AppState::new(db, connector, sender, &config);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let sweep_handle = (config.engine.sweep_interval_secs > 0).then(|| {
        Arc::clone(&state.sweeper).spawn_periodic(
            Duration::from_secs(config.engine.sweep_interval_secs),
            shutdown_rx,
        )
    });

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let listener = tokio::net::TcpListener::bind(args.addr).await?;
    info!(addr = %args.addr, "HTTP server ready");

    axum::serve(listener, build_router(state.clone()))
        .with_graceful_shutdown(async move {
            #[cfg(unix)]
            let sigterm_future = sigterm.recv();
            #[cfg(not(unix))]
            let sigterm_future = std::future::pending::<Option<()>>();

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C shutdown signal");
                }
                _ = sigterm_future => {
                    info!("Received SIGTERM shutdown signal");
                }
            }
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = sweep_handle {
        let _ = handle.await;
    }
    state.messaging.shutdown().await;
    state.sync.shutdown().await;

    info!("vpnfleetd stopped");
    Ok(())
}
