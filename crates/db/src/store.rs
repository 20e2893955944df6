//! The persistence contract the engine runs against.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::models::{
    NodeRunRow, NodeRunStatus, NodeRunTransition, PipelineRow, RunRow, RunStatus,
};
use crate::repository::{node_runs, pipelines, runs};
use crate::{DbError, DbPool};

/// Durable storage for pipelines, runs and node runs.
///
/// Every status change goes through a conditional transition: the update
/// only applies when the current status is in the `from` set, and the
/// returned `bool` says whether it did.  Callers use that to make
/// completion, failure and cancellation exactly-once.
#[async_trait]
pub trait Store: Send + Sync {
    // --- pipelines ---------------------------------------------------------

    async fn create_pipeline(
        &self,
        name: &str,
        description: Option<&str>,
        definition: Value,
    ) -> Result<PipelineRow, DbError>;

    async fn get_pipeline(&self, id: Uuid) -> Result<PipelineRow, DbError>;

    async fn list_pipelines(&self) -> Result<Vec<PipelineRow>, DbError>;

    async fn update_pipeline(
        &self,
        id: Uuid,
        name: &str,
        description: Option<&str>,
        definition: Value,
    ) -> Result<PipelineRow, DbError>;

    /// Deletes the pipeline and all of its runs.
    async fn delete_pipeline(&self, id: Uuid) -> Result<(), DbError>;

    // --- runs --------------------------------------------------------------

    /// Create a `PENDING` run with one `PENDING` node run per `node_ids`
    /// entry, atomically.
    async fn create_run(
        &self,
        pipeline_id: Uuid,
        input: Value,
        definition: Value,
        node_ids: &[String],
    ) -> Result<RunRow, DbError>;

    async fn get_run(&self, id: Uuid) -> Result<RunRow, DbError>;

    /// Runs of one pipeline, newest first.
    async fn list_runs(&self, pipeline_id: Uuid) -> Result<Vec<RunRow>, DbError>;

    async fn delete_run(&self, id: Uuid) -> Result<(), DbError>;

    async fn transition_run(
        &self,
        id: Uuid,
        from: &[RunStatus],
        to: RunStatus,
        output: Option<Value>,
    ) -> Result<bool, DbError>;

    // --- node runs ---------------------------------------------------------

    /// Node runs of a run, in pipeline node order.
    async fn list_node_runs(&self, run_id: Uuid) -> Result<Vec<NodeRunRow>, DbError>;

    async fn get_node_run(&self, run_id: Uuid, node_id: &str) -> Result<NodeRunRow, DbError>;

    async fn find_node_run_by_job(&self, job_id: &str) -> Result<Option<NodeRunRow>, DbError>;

    async fn transition_node_run(
        &self,
        run_id: Uuid,
        node_id: &str,
        from: &[NodeRunStatus],
        transition: NodeRunTransition,
    ) -> Result<bool, DbError>;

    async fn set_node_job(&self, run_id: Uuid, node_id: &str, job_id: &str)
        -> Result<(), DbError>;

    /// Fail every open (`PENDING` or `RUNNING`) node run of `run_id`.
    /// Returns the rows that changed.
    async fn fail_open_node_runs(
        &self,
        run_id: Uuid,
        error: &str,
    ) -> Result<Vec<NodeRunRow>, DbError>;

    /// Node runs still waiting on a job inside a `RUNNING` run.
    async fn list_inflight_jobs(&self) -> Result<Vec<NodeRunRow>, DbError>;
}

/// [`Store`] backed by Postgres.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_pipeline(
        &self,
        name: &str,
        description: Option<&str>,
        definition: Value,
    ) -> Result<PipelineRow, DbError> {
        pipelines::create_pipeline(&self.pool, name, description, definition).await
    }

    async fn get_pipeline(&self, id: Uuid) -> Result<PipelineRow, DbError> {
        pipelines::get_pipeline(&self.pool, id).await
    }

    async fn list_pipelines(&self) -> Result<Vec<PipelineRow>, DbError> {
        pipelines::list_pipelines(&self.pool).await
    }

    async fn update_pipeline(
        &self,
        id: Uuid,
        name: &str,
        description: Option<&str>,
        definition: Value,
    ) -> Result<PipelineRow, DbError> {
        pipelines::update_pipeline(&self.pool, id, name, description, definition).await
    }

    async fn delete_pipeline(&self, id: Uuid) -> Result<(), DbError> {
        pipelines::delete_pipeline(&self.pool, id).await
    }

    async fn create_run(
        &self,
        pipeline_id: Uuid,
        input: Value,
        definition: Value,
        node_ids: &[String],
    ) -> Result<RunRow, DbError> {
        runs::create_run(&self.pool, pipeline_id, input, definition, node_ids).await
    }

    async fn get_run(&self, id: Uuid) -> Result<RunRow, DbError> {
        runs::get_run(&self.pool, id).await
    }

    async fn list_runs(&self, pipeline_id: Uuid) -> Result<Vec<RunRow>, DbError> {
        runs::list_runs(&self.pool, pipeline_id).await
    }

    async fn delete_run(&self, id: Uuid) -> Result<(), DbError> {
        runs::delete_run(&self.pool, id).await
    }

    async fn transition_run(
        &self,
        id: Uuid,
        from: &[RunStatus],
        to: RunStatus,
        output: Option<Value>,
    ) -> Result<bool, DbError> {
        runs::transition_run(&self.pool, id, from, to, output).await
    }

    async fn list_node_runs(&self, run_id: Uuid) -> Result<Vec<NodeRunRow>, DbError> {
        node_runs::list_node_runs(&self.pool, run_id).await
    }

    async fn get_node_run(&self, run_id: Uuid, node_id: &str) -> Result<NodeRunRow, DbError> {
        node_runs::get_node_run(&self.pool, run_id, node_id).await
    }

    async fn find_node_run_by_job(&self, job_id: &str) -> Result<Option<NodeRunRow>, DbError> {
        node_runs::find_by_job(&self.pool, job_id).await
    }

    async fn transition_node_run(
        &self,
        run_id: Uuid,
        node_id: &str,
        from: &[NodeRunStatus],
        transition: NodeRunTransition,
    ) -> Result<bool, DbError> {
        node_runs::transition_node_run(&self.pool, run_id, node_id, from, transition).await
    }

    async fn set_node_job(
        &self,
        run_id: Uuid,
        node_id: &str,
        job_id: &str,
    ) -> Result<(), DbError> {
        node_runs::set_job(&self.pool, run_id, node_id, job_id).await
    }

    async fn fail_open_node_runs(
        &self,
        run_id: Uuid,
        error: &str,
    ) -> Result<Vec<NodeRunRow>, DbError> {
        node_runs::fail_open(&self.pool, run_id, error).await
    }

    async fn list_inflight_jobs(&self) -> Result<Vec<NodeRunRow>, DbError> {
        node_runs::list_inflight(&self.pool).await
    }
}
