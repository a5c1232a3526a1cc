//! Messaging and recipient routes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{ApiResult, AppState};
use crate::error::FleetError;
use crate::messaging::SendOutcome;
use crate::storage::{NewRecipient, Recipient};

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/messages", post(send_message))
        .route("/api/recipients", get(list_recipients).post(register_recipient))
        .route("/api/recipients/{telegram_id}", delete(deactivate_recipient))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendBody {
    text: String,
    #[serde(default)]
    recipient_id: Option<String>,
}

/// 200 with counts for a single recipient, 202 once a broadcast is queued.
async fn send_message(
    State(state): State<AppState>,
    Json(body): Json<SendBody>,
) -> ApiResult<(StatusCode, Json<SendOutcome>)> {
    let outcome = state
        .messaging
        .send(&body.text, body.recipient_id.as_deref())
        .await?;
    let status = match outcome {
        SendOutcome::Delivered(_) => StatusCode::OK,
        SendOutcome::Accepted => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecipientQuery {
    #[serde(default)]
    active_only: bool,
}

async fn list_recipients(
    State(state): State<AppState>,
    Query(query): Query<RecipientQuery>,
) -> ApiResult<Json<Vec<Recipient>>> {
    Ok(Json(state.db.list_recipients(query.active_only).await?))
}

async fn register_recipient(
    State(state): State<AppState>,
    Json(params): Json<NewRecipient>,
) -> ApiResult<Json<Recipient>> {
    if params.telegram_id.trim().is_empty() {
        return Err(FleetError::Validation("telegramId is required".into()).into());
    }
    Ok(Json(state.db.upsert_recipient(&params).await?))
}

async fn deactivate_recipient(
    State(state): State<AppState>,
    Path(telegram_id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.db.deactivate_recipient(&telegram_id).await? {
        return Err(FleetError::NotFound(format!("Recipient {telegram_id}")).into());
    }
    Ok(Json(json!({ "ok": true })))
}
