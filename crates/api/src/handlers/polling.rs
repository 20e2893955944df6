use axum::{extract::State, Json};
use engine::PollingStatus;
use serde::Serialize;

use crate::error::ApiResult;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ResumeReport {
    pub resumed: usize,
    #[serde(flatten)]
    pub status: PollingStatus,
}

/// GET /jobs/polling
pub async fn status(State(state): State<AppState>) -> Json<PollingStatus> {
    Json(state.controller.polling_status())
}

/// POST /jobs/polling
///
/// Restart poll tasks for every job still in flight.
pub async fn resume(State(state): State<AppState>) -> ApiResult<Json<ResumeReport>> {
    let resumed = state.controller.resume_polling().await?;
    Ok(Json(ResumeReport {
        resumed,
        status: state.controller.polling_status(),
    }))
}
