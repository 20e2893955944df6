//! Job board notifications.

use axum::{extract::rejection::JsonRejection, extract::State, Json};
use engine::WebhookOutcome;
use jobboard::JobWebhook;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct WebhookReceipt {
    pub received: bool,
    pub outcome: WebhookOutcome,
}

/// POST /webhooks/jobs
///
/// Unknown jobs are acknowledged with `200` so the board does not retry.
pub async fn receive(
    State(state): State<AppState>,
    payload: Result<Json<JobWebhook>, JsonRejection>,
) -> ApiResult<Json<WebhookReceipt>> {
    let Json(payload) = payload.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    if payload.job_id.trim().is_empty() {
        return Err(ApiError::BadRequest("job_id is required".into()));
    }

    let outcome = state.controller.handle_webhook(payload).await?;
    Ok(Json(WebhookReceipt {
        received: true,
        outcome,
    }))
}

/// GET /webhooks/jobs
///
/// Lets the board check the endpoint is reachable before registering it.
pub async fn verify() -> Json<Value> {
    Json(json!({ "status": "ok", "endpoint": "/api/v1/webhooks/jobs" }))
}
