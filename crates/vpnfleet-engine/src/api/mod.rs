//! JSON HTTP surface.
//!
//! Handlers are thin: they decode the request, call one engine operation
//! and encode its result. [`FleetError`] maps onto status codes in
//! [`ApiError`].

mod fleet;
mod messages;
mod subscriptions;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use vpnfleet_core::Config;

use crate::error::FleetError;
use crate::fleet::FleetDistributor;
use crate::messaging::{MessageSender, MessagingDispatcher};
use crate::migrate::IdentityMigrator;
use crate::panel::PanelConnector;
use crate::provision::Provisioner;
use crate::storage::{FleetDatabase, RosterSource};
use crate::sweeper::ExpirationSweeper;
use crate::sync::SyncJobManager;

/// Shared application state: the database plus every engine service.
#[derive(Clone)]
pub struct AppState {
    pub db: FleetDatabase,
    pub provisioner: Arc<Provisioner>,
    pub sweeper: Arc<ExpirationSweeper>,
    pub sync: Arc<SyncJobManager>,
    pub migrator: Arc<IdentityMigrator>,
    pub messaging: Arc<MessagingDispatcher>,
    pub public_base_url: Arc<str>,
}

impl AppState {
    /// Wire the engine services together.
    pub fn new(
        db: FleetDatabase,
        connector: Arc<dyn PanelConnector>,
        sender: Arc<dyn MessageSender>,
        config: &Config,
    ) -> Self {
        let engine = &config.engine;
        let call_timeout = Duration::from_secs(engine.call_timeout_secs);
        let distributor = Arc::new(FleetDistributor::new(
            Arc::clone(&connector),
            engine.fanout_parallelism,
            call_timeout,
        ));
        let roster: Arc<dyn RosterSource> = Arc::new(db.clone());

        Self {
            provisioner: Arc::new(Provisioner::new(
                db.clone(),
                Arc::clone(&distributor),
                config.subscription.default_device_limit,
            )),
            sweeper: Arc::new(ExpirationSweeper::new(
                db.clone(),
                Arc::clone(&roster),
                distributor,
            )),
            sync: Arc::new(SyncJobManager::new(
                db.clone(),
                Arc::clone(&connector),
                call_timeout,
                engine.sync_per_client_ms,
            )),
            migrator: Arc::new(IdentityMigrator::new(
                db.clone(),
                connector,
                engine.fanout_parallelism,
                call_timeout,
            )),
            messaging: Arc::new(MessagingDispatcher::new(
                sender,
                roster,
                Duration::from_millis(engine.broadcast_pacing_ms),
            )),
            public_base_url: Arc::from(config.subscription.public_base_url.as_str()),
            db,
        }
    }
}

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(subscriptions::routes())
        .merge(fleet::routes())
        .merge(messages::routes())
        .route("/api/connection-string/parse", post(fleet::parse_connection_string))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Error response wrapper for handlers.
#[derive(Debug)]
pub struct ApiError(FleetError);

impl<E: Into<FleetError>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FleetError::Validation(_) => StatusCode::BAD_REQUEST,
            FleetError::NotFound(_) => StatusCode::NOT_FOUND,
            FleetError::Conflict(_) => StatusCode::CONFLICT,
            FleetError::Storage(e) => {
                error!(error = %e, "Storage failure while handling request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
