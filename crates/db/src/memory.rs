//! In-process [`Store`] used by tests and `serve --memory`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::models::{
    NodeRunRow, NodeRunStatus, NodeRunTransition, PipelineRow, RunRow, RunStatus,
};
use crate::{DbError, Store};

#[derive(Default)]
struct State {
    /// Insertion order; listing walks it backwards for newest-first.
    pipelines: Vec<PipelineRow>,
    runs: Vec<RunRow>,
    node_runs: HashMap<Uuid, Vec<NodeRunRow>>,
}

impl State {
    fn run_mut(&mut self, id: Uuid) -> Result<&mut RunRow, DbError> {
        self.runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(DbError::NotFound)
    }

    fn node_run_mut(&mut self, run_id: Uuid, node_id: &str) -> Result<&mut NodeRunRow, DbError> {
        self.node_runs
            .get_mut(&run_id)
            .and_then(|nodes| nodes.iter_mut().find(|n| n.node_id == node_id))
            .ok_or(DbError::NotFound)
    }

    fn run_status(&self, run_id: Uuid) -> Option<RunStatus> {
        self.runs.iter().find(|r| r.id == run_id).map(|r| r.status)
    }
}

/// A [`Store`] that keeps everything behind one mutex.
///
/// Transitions are checked and applied under the lock, so they have the
/// same all-or-nothing behaviour as the conditional `UPDATE`s in Postgres.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_pipeline(
        &self,
        name: &str,
        description: Option<&str>,
        definition: Value,
    ) -> Result<PipelineRow, DbError> {
        let now = Utc::now();
        let row = PipelineRow {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            description: description.map(str::to_owned),
            definition,
            created_at: now,
            updated_at: now,
        };
        self.state().pipelines.push(row.clone());
        Ok(row)
    }

    async fn get_pipeline(&self, id: Uuid) -> Result<PipelineRow, DbError> {
        self.state()
            .pipelines
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or(DbError::NotFound)
    }

    async fn list_pipelines(&self) -> Result<Vec<PipelineRow>, DbError> {
        Ok(self.state().pipelines.iter().rev().cloned().collect())
    }

    async fn update_pipeline(
        &self,
        id: Uuid,
        name: &str,
        description: Option<&str>,
        definition: Value,
    ) -> Result<PipelineRow, DbError> {
        let mut state = self.state();
        let row = state
            .pipelines
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(DbError::NotFound)?;
        row.name = name.to_owned();
        row.description = description.map(str::to_owned);
        row.definition = definition;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn delete_pipeline(&self, id: Uuid) -> Result<(), DbError> {
        let mut state = self.state();
        let before = state.pipelines.len();
        state.pipelines.retain(|p| p.id != id);
        if state.pipelines.len() == before {
            return Err(DbError::NotFound);
        }

        let removed: Vec<Uuid> = state
            .runs
            .iter()
            .filter(|r| r.pipeline_id == id)
            .map(|r| r.id)
            .collect();
        state.runs.retain(|r| r.pipeline_id != id);
        for run_id in removed {
            state.node_runs.remove(&run_id);
        }
        Ok(())
    }

    async fn create_run(
        &self,
        pipeline_id: Uuid,
        input: Value,
        definition: Value,
        node_ids: &[String],
    ) -> Result<RunRow, DbError> {
        let mut state = self.state();
        if !state.pipelines.iter().any(|p| p.id == pipeline_id) {
            return Err(DbError::NotFound);
        }

        let run = RunRow {
            id: Uuid::new_v4(),
            pipeline_id,
            status: RunStatus::Pending,
            input,
            output: None,
            definition,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let nodes = node_ids
            .iter()
            .map(|node_id| NodeRunRow {
                id: Uuid::new_v4(),
                run_id: run.id,
                node_id: node_id.clone(),
                status: NodeRunStatus::Pending,
                job_id: None,
                input: None,
                output: None,
                error: None,
                started_at: None,
                completed_at: None,
            })
            .collect();

        state.node_runs.insert(run.id, nodes);
        state.runs.push(run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: Uuid) -> Result<RunRow, DbError> {
        self.state()
            .runs
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(DbError::NotFound)
    }

    async fn list_runs(&self, pipeline_id: Uuid) -> Result<Vec<RunRow>, DbError> {
        Ok(self
            .state()
            .runs
            .iter()
            .rev()
            .filter(|r| r.pipeline_id == pipeline_id)
            .cloned()
            .collect())
    }

    async fn delete_run(&self, id: Uuid) -> Result<(), DbError> {
        let mut state = self.state();
        let before = state.runs.len();
        state.runs.retain(|r| r.id != id);
        if state.runs.len() == before {
            return Err(DbError::NotFound);
        }
        state.node_runs.remove(&id);
        Ok(())
    }

    async fn transition_run(
        &self,
        id: Uuid,
        from: &[RunStatus],
        to: RunStatus,
        output: Option<Value>,
    ) -> Result<bool, DbError> {
        let mut state = self.state();
        let run = state.run_mut(id)?;
        if !from.contains(&run.status) {
            return Ok(false);
        }

        let now = Utc::now();
        run.status = to;
        if output.is_some() {
            run.output = output;
        }
        if to == RunStatus::Running {
            run.started_at = Some(now);
        }
        if to.is_terminal() {
            run.completed_at = Some(now);
        }
        Ok(true)
    }

    async fn list_node_runs(&self, run_id: Uuid) -> Result<Vec<NodeRunRow>, DbError> {
        Ok(self
            .state()
            .node_runs
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_node_run(&self, run_id: Uuid, node_id: &str) -> Result<NodeRunRow, DbError> {
        self.state().node_run_mut(run_id, node_id).map(|n| n.clone())
    }

    async fn find_node_run_by_job(&self, job_id: &str) -> Result<Option<NodeRunRow>, DbError> {
        Ok(self
            .state()
            .node_runs
            .values()
            .flatten()
            .find(|n| n.job_id.as_deref() == Some(job_id))
            .cloned())
    }

    async fn transition_node_run(
        &self,
        run_id: Uuid,
        node_id: &str,
        from: &[NodeRunStatus],
        transition: NodeRunTransition,
    ) -> Result<bool, DbError> {
        let mut state = self.state();
        let node = state.node_run_mut(run_id, node_id)?;
        if !from.contains(&node.status) {
            return Ok(false);
        }

        let now = Utc::now();
        node.status = transition.to;
        if transition.input.is_some() {
            node.input = transition.input;
        }
        if transition.output.is_some() {
            node.output = transition.output;
        }
        if transition.error.is_some() {
            node.error = transition.error;
        }
        if transition.to == NodeRunStatus::Running {
            node.started_at = Some(now);
        }
        if transition.to.is_terminal() {
            node.completed_at = Some(now);
        }
        Ok(true)
    }

    async fn set_node_job(
        &self,
        run_id: Uuid,
        node_id: &str,
        job_id: &str,
    ) -> Result<(), DbError> {
        self.state().node_run_mut(run_id, node_id)?.job_id = Some(job_id.to_owned());
        Ok(())
    }

    async fn fail_open_node_runs(
        &self,
        run_id: Uuid,
        error: &str,
    ) -> Result<Vec<NodeRunRow>, DbError> {
        let mut state = self.state();
        let now = Utc::now();
        let Some(nodes) = state.node_runs.get_mut(&run_id) else {
            return Ok(Vec::new());
        };

        let mut changed = Vec::new();
        for node in nodes
            .iter_mut()
            .filter(|n| matches!(n.status, NodeRunStatus::Pending | NodeRunStatus::Running))
        {
            node.status = NodeRunStatus::Failed;
            node.error = Some(error.to_owned());
            node.completed_at = Some(now);
            changed.push(node.clone());
        }
        Ok(changed)
    }

    async fn list_inflight_jobs(&self) -> Result<Vec<NodeRunRow>, DbError> {
        let state = self.state();
        let mut inflight: Vec<NodeRunRow> = state
            .node_runs
            .values()
            .flatten()
            .filter(|n| {
                n.status == NodeRunStatus::Running
                    && n.job_id.is_some()
                    && state.run_status(n.run_id) == Some(RunStatus::Running)
            })
            .cloned()
            .collect();
        inflight.sort_by_key(|n| n.started_at);
        Ok(inflight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded() -> (MemoryStore, RunRow) {
        let store = MemoryStore::new();
        let pipeline = store
            .create_pipeline("p", None, json!({}))
            .await
            .unwrap();
        let run = store
            .create_run(
                pipeline.id,
                json!({ "seed": 1 }),
                json!({}),
                &["a".to_owned(), "b".to_owned()],
            )
            .await
            .unwrap();
        (store, run)
    }

    #[tokio::test]
    async fn create_run_seeds_pending_node_runs_in_order() {
        let (store, run) = seeded().await;

        assert_eq!(run.status, RunStatus::Pending);
        let nodes = store.list_node_runs(run.id).await.unwrap();
        let ids: Vec<&str> = nodes.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert!(nodes.iter().all(|n| n.status == NodeRunStatus::Pending));
    }

    #[tokio::test]
    async fn create_run_for_missing_pipeline_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .create_run(Uuid::new_v4(), json!({}), json!({}), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound));
    }

    #[tokio::test]
    async fn run_transition_applies_once() {
        let (store, run) = seeded().await;

        assert!(store
            .transition_run(run.id, &[RunStatus::Pending], RunStatus::Running, None)
            .await
            .unwrap());
        assert!(store
            .transition_run(
                run.id,
                &[RunStatus::Running],
                RunStatus::Completed,
                Some(json!({ "ok": true }))
            )
            .await
            .unwrap());
        assert!(!store
            .transition_run(
                run.id,
                &[RunStatus::Running],
                RunStatus::Failed,
                Some(json!({ "error": "late" }))
            )
            .await
            .unwrap());

        let run = store.get_run(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output, Some(json!({ "ok": true })));
        assert!(run.started_at.is_some());
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn node_transition_stamps_times_and_keeps_input() {
        let (store, run) = seeded().await;

        store
            .transition_node_run(
                run.id,
                "a",
                &[NodeRunStatus::Pending],
                NodeRunTransition::start(json!({ "x": 1 })),
            )
            .await
            .unwrap();
        store
            .transition_node_run(
                run.id,
                "a",
                &[NodeRunStatus::Running],
                NodeRunTransition::complete(json!({ "y": 2 })),
            )
            .await
            .unwrap();

        let node = store.get_node_run(run.id, "a").await.unwrap();
        assert_eq!(node.status, NodeRunStatus::Completed);
        assert_eq!(node.input, Some(json!({ "x": 1 })));
        assert_eq!(node.output, Some(json!({ "y": 2 })));
        assert!(node.started_at.is_some() && node.completed_at.is_some());
    }

    #[tokio::test]
    async fn job_lookup_and_inflight_listing() {
        let (store, run) = seeded().await;
        store
            .transition_run(run.id, &[RunStatus::Pending], RunStatus::Running, None)
            .await
            .unwrap();
        store
            .transition_node_run(
                run.id,
                "a",
                &[NodeRunStatus::Pending],
                NodeRunTransition::start(json!({})),
            )
            .await
            .unwrap();
        store.set_node_job(run.id, "a", "job-1").await.unwrap();

        let found = store.find_node_run_by_job("job-1").await.unwrap().unwrap();
        assert_eq!(found.node_id, "a");
        assert!(store.find_node_run_by_job("nope").await.unwrap().is_none());

        let inflight = store.list_inflight_jobs().await.unwrap();
        assert_eq!(inflight.len(), 1);

        store
            .transition_run(run.id, &[RunStatus::Running], RunStatus::Failed, None)
            .await
            .unwrap();
        assert!(store.list_inflight_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fail_open_skips_finished_nodes() {
        let (store, run) = seeded().await;
        store
            .transition_node_run(
                run.id,
                "a",
                &[NodeRunStatus::Pending],
                NodeRunTransition::complete(json!({})),
            )
            .await
            .unwrap();

        let changed = store.fail_open_node_runs(run.id, "stop").await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].node_id, "b");
        assert_eq!(changed[0].error.as_deref(), Some("stop"));

        let a = store.get_node_run(run.id, "a").await.unwrap();
        assert_eq!(a.status, NodeRunStatus::Completed);
    }

    #[tokio::test]
    async fn deleting_pipeline_removes_its_runs() {
        let (store, run) = seeded().await;
        store.delete_pipeline(run.pipeline_id).await.unwrap();

        assert!(matches!(store.get_run(run.id).await, Err(DbError::NotFound)));
        assert!(store.list_node_runs(run.id).await.unwrap().is_empty());
        assert!(matches!(
            store.delete_pipeline(run.pipeline_id).await,
            Err(DbError::NotFound)
        ));
    }
}
