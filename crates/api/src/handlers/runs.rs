use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use db::models::RunRow;
use engine::RunDetails;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct StartRun {
    /// Run input; must be a JSON object.  Missing means `{}`.
    #[serde(default)]
    pub input: Value,
}

/// POST /pipelines/{id}/runs
///
/// Responds once the first wave of nodes has been dispatched.  The body is
/// optional.
pub async fn start(
    State(state): State<AppState>,
    Path(pipeline_id): Path<Uuid>,
    body: Option<Json<StartRun>>,
) -> ApiResult<(StatusCode, Json<RunRow>)> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let run = state.controller.start_run(pipeline_id, req.input).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

/// GET /pipelines/{id}/runs
pub async fn list(
    State(state): State<AppState>,
    Path(pipeline_id): Path<Uuid>,
) -> ApiResult<Json<Vec<RunRow>>> {
    Ok(Json(state.controller.list_runs(pipeline_id).await?))
}

/// GET /runs/{id}
pub async fn get(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<RunDetails>> {
    Ok(Json(state.controller.get_run(run_id).await?))
}

/// POST /runs/{id}/cancel
pub async fn cancel(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<RunRow>> {
    tracing::info!(%run_id, "cancel requested");
    Ok(Json(state.controller.cancel_run(run_id).await?))
}
