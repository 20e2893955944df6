//! Engine-level error types.

use db::models::RunStatus;
use db::DbError;
use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the run engine (validation + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// The pipeline has no nodes.
    #[error("pipeline has no nodes")]
    EmptyPipeline,

    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// An edge references a node ID that doesn't exist in the pipeline.
    #[error("edge references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference {
        node_id: String,
        side: &'static str,
    },

    /// Topological sort detected a cycle.
    #[error("pipeline graph contains a cycle")]
    CycleDetected,

    /// The stored definition does not decode into a pipeline.
    #[error("invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    /// The run input is not a JSON object.
    #[error("invalid run input: {0}")]
    InvalidInput(String),

    // ------ Lookup / state errors ------

    #[error("pipeline {0} not found")]
    PipelineNotFound(Uuid),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    /// The requested operation is not allowed in the run's current status.
    #[error("run {run_id} is {status}")]
    InvalidRunState { run_id: Uuid, status: RunStatus },

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] DbError),
}

impl EngineError {
    /// Structural problems with the graph itself.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EmptyPipeline
                | Self::DuplicateNodeId(_)
                | Self::UnknownNodeReference { .. }
                | Self::CycleDetected
                | Self::InvalidDefinition(_)
        )
    }
}

/// Turn a store `NotFound` into a specific engine error.
pub(crate) trait OrNotFound<T> {
    fn or_not_found(self, err: impl FnOnce() -> EngineError) -> Result<T, EngineError>;
}

impl<T> OrNotFound<T> for Result<T, DbError> {
    fn or_not_found(self, err: impl FnOnce() -> EngineError) -> Result<T, EngineError> {
        self.map_err(|e| match e {
            DbError::NotFound => err(),
            other => EngineError::Database(other),
        })
    }
}
