//! Subscription routes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::{ApiResult, AppState};
use crate::fleet::FleetResult;
use crate::links::{SubscriptionLinks, subscription_links};
use crate::provision::{CreateSubscription, ServerTarget};
use crate::storage::{
    Subscription, SubscriptionFilter, SubscriptionSource, SubscriptionStats, SubscriptionStatus,
};
use crate::sweeper::RevokedClient;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/subscriptions", get(list).post(create))
        .route("/api/subscriptions/stats", get(stats))
        .route("/api/subscriptions/process-expired", post(process_expired))
        .route("/api/subscriptions/{id}", get(fetch).delete(remove))
        .route("/api/subscriptions/{id}/extend", post(extend))
        .route("/api/subscriptions/{id}/links", get(links))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    search: Option<String>,
    source: Option<SubscriptionSource>,
    status: Option<SubscriptionStatus>,
    owner_ref: Option<String>,
}

async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Subscription>>> {
    let filter = SubscriptionFilter {
        search: query.search.filter(|s| !s.is_empty()),
        source: query.source,
        status: query.status,
        owner_ref: query.owner_ref.filter(|s| !s.is_empty()),
    };
    Ok(Json(state.db.list_subscriptions(&filter).await?))
}

async fn stats(State(state): State<AppState>) -> ApiResult<Json<SubscriptionStats>> {
    Ok(Json(state.db.subscription_stats().await?))
}

async fn fetch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Subscription>> {
    Ok(Json(state.db.get_subscription(&id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody {
    days: i64,
    #[serde(default)]
    owner_ref: Option<String>,
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    source: SubscriptionSource,
    #[serde(default)]
    target: ServerTarget,
    /// Shorthand for a pool target.
    #[serde(default)]
    pool_id: Option<i64>,
    /// Shorthand for an explicit server list.
    #[serde(default)]
    server_ids: Option<Vec<i64>>,
    #[serde(default)]
    device_limit: Option<i64>,
    #[serde(default)]
    traffic_limit: Option<i64>,
}

impl CreateBody {
    fn resolve_target(&mut self) -> ServerTarget {
        if let Some(ids) = self.server_ids.take() {
            ServerTarget::Servers(ids)
        } else if let Some(pool_id) = self.pool_id {
            ServerTarget::Pool(pool_id)
        } else {
            std::mem::take(&mut self.target)
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerRef {
    id: i64,
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FailedServer {
    id: i64,
    name: String,
    error: String,
}

/// Fan-out summary shared by create and delete responses.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FanoutSummary {
    servers_total: usize,
    servers_success: usize,
    servers_failed: usize,
    success_servers: Vec<ServerRef>,
    failed_servers: Vec<FailedServer>,
}

impl From<FleetResult> for FanoutSummary {
    fn from(result: FleetResult) -> Self {
        let mut success_servers = Vec::new();
        let mut failed_servers = Vec::new();
        for outcome in result.per_server {
            if outcome.ok {
                success_servers.push(ServerRef {
                    id: outcome.server_id,
                    name: outcome.server_name,
                });
            } else {
                failed_servers.push(FailedServer {
                    id: outcome.server_id,
                    name: outcome.server_name,
                    error: outcome.error.unwrap_or_default(),
                });
            }
        }
        Self {
            servers_total: result.servers_total,
            servers_success: result.servers_success,
            servers_failed: result.servers_failed,
            success_servers,
            failed_servers,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateResponse {
    subscription: Subscription,
    #[serde(flatten)]
    fanout: FanoutSummary,
}

async fn create(
    State(state): State<AppState>,
    Json(mut body): Json<CreateBody>,
) -> ApiResult<(StatusCode, Json<CreateResponse>)> {
    let target = body.resolve_target();
    let (subscription, result) = state
        .provisioner
        .create(CreateSubscription {
            days: body.days,
            owner_ref: body.owner_ref,
            note: body.note,
            source: body.source,
            target,
            device_limit: body.device_limit,
            traffic_limit: body.traffic_limit,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateResponse {
            subscription,
            fanout: result.into(),
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct ExtendBody {
    days: i64,
}

async fn extend(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ExtendBody>,
) -> ApiResult<Json<Subscription>> {
    Ok(Json(state.provisioner.extend(&id, body.days).await?))
}

#[derive(Debug, Serialize)]
struct DeleteResponse {
    ok: bool,
    #[serde(flatten)]
    fanout: FanoutSummary,
}

async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeleteResponse>> {
    let result = state.provisioner.delete(&id).await?;
    Ok(Json(DeleteResponse {
        ok: true,
        fanout: result.into(),
    }))
}

async fn links(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SubscriptionLinks>> {
    Ok(Json(
        subscription_links(&state.db, &state.public_base_url, &id).await?,
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcessExpiredResponse {
    expired: usize,
    clients_removed: Vec<RevokedClient>,
}

async fn process_expired(State(state): State<AppState>) -> ApiResult<Json<ProcessExpiredResponse>> {
    let report = state.sweeper.run().await?;
    Ok(Json(ProcessExpiredResponse {
        expired: report.expired_count,
        clients_removed: report.revoked,
    }))
}
