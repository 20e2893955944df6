//! Pipeline CRUD and validation.
//!
//! Saving a pipeline checks its structure (unique ids, edges pointing at
//! real nodes).  Cycles are only rejected when a run starts, or on demand
//! through `POST /pipelines/{id}/validate`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use db::DbError;
use engine::{topological_order, validate_structure, Pipeline, PipelineDefinition};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// Body of `POST /pipelines` and `PUT /pipelines/{id}`.
#[derive(Debug, Deserialize)]
pub struct SavePipeline {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub definition: PipelineDefinition,
}

impl SavePipeline {
    fn check(&self) -> ApiResult<()> {
        if self.name.trim().is_empty() {
            return Err(ApiError::BadRequest("pipeline name is required".into()));
        }
        validate_structure(&self.definition)?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn pipeline_lookup(id: Uuid) -> impl FnOnce(DbError) -> ApiError {
    move |err| match err {
        DbError::NotFound => ApiError::NotFound(format!("pipeline {id} not found")),
        other => other.into(),
    }
}

/// POST /pipelines
pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<SavePipeline>,
) -> ApiResult<(StatusCode, Json<Pipeline>)> {
    req.check()?;
    tracing::info!(name = %req.name, nodes = req.definition.nodes.len(), "creating pipeline");

    let row = state
        .controller
        .store()
        .create_pipeline(
            &req.name,
            req.description.as_deref(),
            req.definition.to_value()?,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(Pipeline::try_from(row)?)))
}

/// GET /pipelines
pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<Pipeline>>> {
    let rows = state.controller.store().list_pipelines().await?;
    let pipelines = rows
        .into_iter()
        .map(Pipeline::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(pipelines))
}

/// GET /pipelines/{id}
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Pipeline>> {
    let row = state
        .controller
        .store()
        .get_pipeline(id)
        .await
        .map_err(pipeline_lookup(id))?;
    Ok(Json(Pipeline::try_from(row)?))
}

/// PUT /pipelines/{id}
///
/// Runs already started keep the definition they were created with.
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SavePipeline>,
) -> ApiResult<Json<Pipeline>> {
    req.check()?;
    tracing::info!(pipeline_id = %id, "updating pipeline");

    let row = state
        .controller
        .store()
        .update_pipeline(
            id,
            &req.name,
            req.description.as_deref(),
            req.definition.to_value()?,
        )
        .await
        .map_err(pipeline_lookup(id))?;

    Ok(Json(Pipeline::try_from(row)?))
}

/// DELETE /pipelines/{id}
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state
        .controller
        .store()
        .delete_pipeline(id)
        .await
        .map_err(pipeline_lookup(id))?;
    tracing::info!(pipeline_id = %id, "pipeline deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /pipelines/{id}/validate
///
/// Always `200` for an existing pipeline; the report says whether it could
/// run and, if so, in which order its nodes would be visited.
pub async fn validate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ValidationReport>> {
    let row = state
        .controller
        .store()
        .get_pipeline(id)
        .await
        .map_err(pipeline_lookup(id))?;

    let report = match PipelineDefinition::from_value(row.definition)
        .and_then(|def| topological_order(&def))
    {
        Ok(order) => ValidationReport {
            valid: true,
            order: Some(order),
            error: None,
        },
        Err(err) => ValidationReport {
            valid: false,
            order: None,
            error: Some(err.to_string()),
        },
    };
    Ok(Json(report))
}
