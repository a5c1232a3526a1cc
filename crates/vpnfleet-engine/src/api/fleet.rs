//! Server, pool, sync and migration routes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use vpnfleet_core::connstr::{ConnectionParams, parse_access_uri};

use super::{ApiResult, AppState};
use crate::error::FleetError;
use crate::migrate::MigrationReport;
use crate::onboard::{Onboarded, onboard_server};
use crate::storage::{NewServer, NewServerPool, Server, ServerPool, ServerPoolUpdate, ServerUpdate};
use crate::sync::SyncJob;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/servers", get(list_servers).post(create_server))
        .route(
            "/api/servers/{id}",
            get(get_server).put(update_server).delete(delete_server),
        )
        .route(
            "/api/servers/{id}/sync",
            get(poll_sync).post(start_sync).delete(clear_sync),
        )
        .route("/api/servers/{id}/migrate", post(migrate))
        .route("/api/server-pools", get(list_pools).post(create_pool))
        .route(
            "/api/server-pools/{id}",
            get(get_pool).put(update_pool).delete(delete_pool),
        )
}

// ============================================================================
// Servers
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerQuery {
    #[serde(alias = "serverPoolId")]
    pool_id: Option<i64>,
}

async fn list_servers(
    State(state): State<AppState>,
    Query(query): Query<ServerQuery>,
) -> ApiResult<Json<Vec<Server>>> {
    Ok(Json(state.db.list_servers(query.pool_id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateServerBody {
    #[serde(default)]
    access_uri: Option<String>,
    #[serde(flatten)]
    form: NewServer,
}

async fn create_server(
    State(state): State<AppState>,
    Json(body): Json<CreateServerBody>,
) -> ApiResult<(StatusCode, Json<Onboarded>)> {
    let onboarded = onboard_server(&state.db, &state.sync, body.form, body.access_uri.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(onboarded)))
}

async fn get_server(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Server>> {
    Ok(Json(state.db.get_server(id).await?))
}

async fn update_server(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(update): Json<ServerUpdate>,
) -> ApiResult<Json<Server>> {
    if update
        .public_port
        .is_some_and(|port| !(1..=65535).contains(&port))
    {
        return Err(FleetError::Validation("publicPort is out of range".into()).into());
    }
    Ok(Json(state.db.update_server(id, update).await?))
}

async fn delete_server(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Value>> {
    if !state.db.delete_server(id).await? {
        return Err(FleetError::NotFound(format!("Server {id}")).into());
    }
    Ok(Json(json!({ "ok": true })))
}

// ============================================================================
// Sync jobs
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncStarted {
    status: &'static str,
    estimated_duration_ms: u64,
}

async fn start_sync(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<(StatusCode, Json<SyncStarted>)> {
    let job = state.sync.start(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SyncStarted {
            status: "started",
            estimated_duration_ms: job.estimated_duration_ms,
        }),
    ))
}

async fn poll_sync(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<SyncJob>> {
    state
        .sync
        .poll(id)
        .map(Json)
        .ok_or_else(|| FleetError::NotFound(format!("No sync job for server {id}")).into())
}

async fn clear_sync(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Value>> {
    state.sync.clear(id)?;
    Ok(Json(json!({ "ok": true })))
}

async fn migrate(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<MigrationReport>> {
    Ok(Json(state.migrator.migrate(id).await?))
}

// ============================================================================
// Pools
// ============================================================================

async fn list_pools(State(state): State<AppState>) -> ApiResult<Json<Vec<ServerPool>>> {
    Ok(Json(state.db.list_pools().await?))
}

async fn create_pool(
    State(state): State<AppState>,
    Json(params): Json<NewServerPool>,
) -> ApiResult<(StatusCode, Json<ServerPool>)> {
    if params.name.trim().is_empty() {
        return Err(FleetError::Validation("name is required".into()).into());
    }
    Ok((StatusCode::CREATED, Json(state.db.create_pool(&params).await?)))
}

async fn get_pool(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<ServerPool>> {
    Ok(Json(state.db.get_pool(id).await?))
}

async fn update_pool(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(update): Json<ServerPoolUpdate>,
) -> ApiResult<Json<ServerPool>> {
    Ok(Json(state.db.update_pool(id, update).await?))
}

async fn delete_pool(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Value>> {
    if !state.db.delete_pool(id).await? {
        return Err(FleetError::NotFound(format!("Server pool {id}")).into());
    }
    Ok(Json(json!({ "ok": true })))
}

// ============================================================================
// Connection strings
// ============================================================================

#[derive(Debug, Deserialize)]
pub(super) struct ParseBody {
    uri: String,
}

#[derive(Debug, Serialize)]
pub(super) struct ParseResponse {
    matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<ConnectionParams>,
}

/// Best-effort parse: an unrecognised string is not an error, just a miss.
pub(super) async fn parse_connection_string(Json(body): Json<ParseBody>) -> Json<ParseResponse> {
    let params = parse_access_uri(&body.uri);
    Json(ParseResponse {
        matched: params.is_some(),
        params,
    })
}
