//! Run lifecycle orchestration.
//!
//! `RunController` is the central orchestrator:
//! 1. Validates the pipeline and creates the run with one `PENDING` node
//!    run per node.
//! 2. Computes the ready set and dispatches it concurrently through the
//!    [`NodeExecutor`], looping while nodes complete synchronously.
//! 3. Registers poll tasks for delegated nodes and applies their verdicts
//!    (and webhook verdicts) through `complete_node` / `fail_node`.
//! 4. Finalizes the run exactly once, or fails / cancels it.
//!
//! Every state change for one run happens under that run's async mutex, so
//! "update node run → recompute readiness → dispatch" never interleaves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures::future::{self, BoxFuture, FutureExt};
use futures::{stream, StreamExt};
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use db::models::{NodeRunRow, NodeRunStatus, NodeRunTransition, RunRow, RunStatus};
use db::Store;
use jobboard::JobBoard;
use queue::TaskRegistry;

use crate::config::EngineConfig;
use crate::dag::topological_order;
use crate::error::OrNotFound;
use crate::events::{EventBus, RunEvent, RunEventKind};
use crate::executor::{Dispatched, NodeExecutor, NodeRegistry, RunRef};
use crate::models::{PipelineDefinition, RunDetails};
use crate::readiness::ready_nodes;
use crate::EngineError;

/// Error recorded on nodes force-failed by a cancellation.
pub const CANCELLED_ERROR: &str = "Cancelled by user";

/// Key under which completed node outputs are exposed to later nodes.
pub const NODE_OUTPUTS_KEY: &str = "node_outputs";

/// Per-run state shared by everything that touches that run.
pub(crate) struct RunState {
    pub pipeline_id: Uuid,
    pub definition: Arc<PipelineDefinition>,
    pub lock: tokio::sync::Mutex<()>,
}

impl RunState {
    fn run_ref(&self, run_id: Uuid) -> RunRef {
        RunRef {
            run_id,
            pipeline_id: self.pipeline_id,
        }
    }
}

pub(crate) struct Inner {
    pub store: Arc<dyn Store>,
    pub board: Arc<dyn JobBoard>,
    pub polls: Arc<dyn TaskRegistry>,
    pub events: EventBus,
    pub executor: NodeExecutor,
    pub config: EngineConfig,
    runs: Mutex<HashMap<Uuid, Arc<RunState>>>,
}

/// Starts, advances, and cancels runs.  Cheap to clone.
#[derive(Clone)]
pub struct RunController {
    pub(crate) inner: Arc<Inner>,
}

impl RunController {
    /// Create a controller.
    ///
    /// Must be used from within a tokio runtime: poll tasks are spawned on it.
    pub fn new(
        store: Arc<dyn Store>,
        board: Arc<dyn JobBoard>,
        nodes: NodeRegistry,
        polls: Arc<dyn TaskRegistry>,
        config: EngineConfig,
    ) -> Self {
        let events = EventBus::new(config.event_buffer);
        let executor = NodeExecutor::new(Arc::clone(&store), nodes, events.clone());
        Self {
            inner: Arc::new(Inner {
                store,
                board,
                polls,
                events,
                executor,
                config,
                runs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Run state cache
    // -----------------------------------------------------------------------

    fn runs(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<RunState>>> {
        self.inner.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The shared state for `run_id`, loading the definition snapshot from
    /// the store on first use.
    pub(crate) async fn run_state(&self, run_id: Uuid) -> Result<Arc<RunState>, EngineError> {
        let cached = self.runs().get(&run_id).cloned();
        if let Some(state) = cached {
            return Ok(state);
        }

        let run = self
            .inner
            .store
            .get_run(run_id)
            .await
            .or_not_found(|| EngineError::RunNotFound(run_id))?;
        let state = Arc::new(RunState {
            pipeline_id: run.pipeline_id,
            definition: Arc::new(PipelineDefinition::from_value(run.definition)?),
            lock: tokio::sync::Mutex::new(()),
        });

        Ok(Arc::clone(self.runs().entry(run_id).or_insert(state)))
    }

    /// Drop cached state once the run can no longer change.
    async fn release_if_finished(&self, run_id: Uuid) -> Result<(), EngineError> {
        let run = self.inner.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            self.runs().remove(&run_id);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Validate the pipeline, create a run and dispatch its first wave.
    ///
    /// Returns the run as it stands once every synchronously completing
    /// node has finished; delegated nodes keep running in the background.
    ///
    /// # Errors
    /// Validation errors are returned before any run is created.
    #[instrument(skip(self, input))]
    pub async fn start_run(&self, pipeline_id: Uuid, input: Value) -> Result<RunRow, EngineError> {
        let row = self
            .inner
            .store
            .get_pipeline(pipeline_id)
            .await
            .or_not_found(|| EngineError::PipelineNotFound(pipeline_id))?;
        let definition = PipelineDefinition::from_value(row.definition)?;
        let order = topological_order(&definition)?;
        let input = normalize_input(input)?;

        info!(nodes = order.len(), ?order, "pipeline validated");

        let run = self
            .inner
            .store
            .create_run(pipeline_id, input, definition.to_value()?, &definition.node_ids())
            .await?;
        let run_id = run.id;

        let state = Arc::new(RunState {
            pipeline_id,
            definition: Arc::new(definition),
            lock: tokio::sync::Mutex::new(()),
        });
        self.runs().insert(run_id, Arc::clone(&state));

        {
            let _guard = state.lock.lock().await;
            self.inner
                .store
                .transition_run(run_id, &[RunStatus::Pending], RunStatus::Running, None)
                .await?;
            info!(%run_id, "run started");
            self.inner.events.publish(
                RunEvent::new(RunEventKind::RunStarted, run_id).pipeline(pipeline_id),
            );

            self.advance_locked(&state, run_id).await?;
        }

        self.release_if_finished(run_id).await?;
        Ok(self.inner.store.get_run(run_id).await?)
    }

    // -----------------------------------------------------------------------
    // Progress
    // -----------------------------------------------------------------------

    /// Dispatch ready waves until nothing more can happen synchronously.
    /// Caller holds the run lock.
    async fn advance_locked(&self, state: &RunState, run_id: Uuid) -> Result<(), EngineError> {
        let store = &self.inner.store;

        loop {
            let run = store.get_run(run_id).await?;
            if run.status != RunStatus::Running {
                return Ok(());
            }

            let node_runs = store.list_node_runs(run_id).await?;
            if node_runs.iter().any(|n| n.status == NodeRunStatus::Failed) {
                return Ok(());
            }
            if node_runs.iter().all(|n| n.status == NodeRunStatus::Completed) {
                return self.finalize_locked(state, run_id, &node_runs).await;
            }

            let ready = ready_nodes(&state.definition, &node_runs);
            if ready.is_empty() {
                return Ok(());
            }

            let input = input_context(&run.input, &node_runs);
            debug!(%run_id, ?ready, "dispatching wave");
            let results = self.dispatch_wave(state, run_id, &ready, &input).await;

            let mut progressed = false;
            let mut failures = Vec::new();
            let mut delegated = Vec::new();
            for (node_id, result) in results {
                match result {
                    Dispatched::Skipped => {}
                    Dispatched::Completed(output) => {
                        progressed |= self.complete_node_locked(state, run_id, &node_id, output).await?;
                    }
                    Dispatched::Delegated(job_id) => delegated.push((node_id, job_id)),
                    Dispatched::Failed(error) => failures.push((node_id, error)),
                }
            }

            if !failures.is_empty() {
                for (node_id, error) in failures {
                    self.fail_node_locked(state, run_id, &node_id, &error).await?;
                }
                return Ok(());
            }

            for (node_id, job_id) in delegated {
                let started_at = store
                    .get_node_run(run_id, &node_id)
                    .await?
                    .started_at
                    .unwrap_or_else(Utc::now);
                self.register_poll(run_id, &node_id, &job_id, started_at);
            }

            if !progressed {
                return Ok(());
            }
        }
    }

    async fn dispatch_wave(
        &self,
        state: &RunState,
        run_id: Uuid,
        ready: &[String],
        input: &Value,
    ) -> Vec<(String, Dispatched)> {
        let run = state.run_ref(run_id);
        let executor = &self.inner.executor;

        // Each call owns its node.
        let calls: Vec<BoxFuture<'_, (String, Dispatched)>> = ready
            .iter()
            .filter_map(|node_id| state.definition.node(node_id).cloned())
            .map(|node| {
                let input = input.clone();
                async move {
                    let result = executor.dispatch(run, &node, input).await;
                    (node.node_id, result)
                }
                .boxed()
            })
            .collect();

        match self.inner.config.max_parallel_dispatch {
            Some(limit) => stream::iter(calls).buffered(limit.max(1)).collect().await,
            None => future::join_all(calls).await,
        }
    }

    /// Aggregate outputs and move the run to `COMPLETED`, once.
    async fn finalize_locked(
        &self,
        state: &RunState,
        run_id: Uuid,
        node_runs: &[NodeRunRow],
    ) -> Result<(), EngineError> {
        let output: Map<String, Value> = node_runs
            .iter()
            .map(|n| (n.node_id.clone(), n.output.clone().unwrap_or(Value::Null)))
            .collect();
        let output = Value::Object(output);

        let applied = self
            .inner
            .store
            .transition_run(
                run_id,
                &[RunStatus::Running],
                RunStatus::Completed,
                Some(output.clone()),
            )
            .await?;

        if applied {
            info!(%run_id, "run completed");
            self.inner.events.publish(
                RunEvent::new(RunEventKind::RunCompleted, run_id)
                    .pipeline(state.pipeline_id)
                    .output(output),
            );
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Completion / failure handlers
    // -----------------------------------------------------------------------

    /// Mark a `RUNNING` node completed and advance the run.
    ///
    /// Returns `false` when the node was not `RUNNING` (a duplicate or late
    /// signal) or its run has already finished; nothing changes in that case.
    pub async fn complete_node(
        &self,
        run_id: Uuid,
        node_id: &str,
        output: Value,
    ) -> Result<bool, EngineError> {
        let state = self.run_state(run_id).await?;
        let applied = {
            let _guard = state.lock.lock().await;
            let applied = self.complete_node_locked(&state, run_id, node_id, output).await?;
            if applied {
                self.advance_locked(&state, run_id).await?;
            }
            applied
        };
        self.release_if_finished(run_id).await?;
        Ok(applied)
    }

    async fn complete_node_locked(
        &self,
        state: &RunState,
        run_id: Uuid,
        node_id: &str,
        output: Value,
    ) -> Result<bool, EngineError> {
        let run = self.inner.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            debug!(%run_id, node_id, status = %run.status, "ignoring completion for finished run");
            return Ok(false);
        }

        let applied = self
            .inner
            .store
            .transition_node_run(
                run_id,
                node_id,
                &[NodeRunStatus::Running],
                NodeRunTransition::complete(output.clone()),
            )
            .await?;

        if !applied {
            debug!(%run_id, node_id, "ignoring completion for node that is not running");
            return Ok(false);
        }

        info!(%run_id, node_id, "node completed");
        self.inner.events.publish(
            RunEvent::new(RunEventKind::NodeCompleted, run_id)
                .pipeline(state.pipeline_id)
                .node(node_id)
                .output(output),
        );
        Ok(true)
    }

    /// Mark a node failed and fail its run.
    ///
    /// Returns `false` when the node had already finished.
    pub async fn fail_node(
        &self,
        run_id: Uuid,
        node_id: &str,
        error: &str,
    ) -> Result<bool, EngineError> {
        let state = self.run_state(run_id).await?;
        let applied = {
            let _guard = state.lock.lock().await;
            self.fail_node_locked(&state, run_id, node_id, error).await?
        };
        self.release_if_finished(run_id).await?;
        Ok(applied)
    }

    async fn fail_node_locked(
        &self,
        state: &RunState,
        run_id: Uuid,
        node_id: &str,
        error: &str,
    ) -> Result<bool, EngineError> {
        let store = &self.inner.store;
        let applied = store
            .transition_node_run(
                run_id,
                node_id,
                &[NodeRunStatus::Pending, NodeRunStatus::Running],
                NodeRunTransition::fail(error),
            )
            .await?;

        if !applied {
            debug!(%run_id, node_id, "ignoring failure for node that already finished");
            return Ok(false);
        }

        warn!(%run_id, node_id, error, "node failed");
        self.inner.events.publish(
            RunEvent::new(RunEventKind::NodeFailed, run_id)
                .pipeline(state.pipeline_id)
                .node(node_id)
                .error(error),
        );

        // The rest of the graph is abandoned.
        self.inner.polls.cancel_run(run_id);

        let message = format!("Node {node_id} failed: {error}");
        let failed = store
            .transition_run(
                run_id,
                &[RunStatus::Pending, RunStatus::Running],
                RunStatus::Failed,
                Some(json!({ "error": message, "failed_node": node_id })),
            )
            .await?;

        if failed {
            warn!(%run_id, %message, "run failed");
            self.inner.events.publish(
                RunEvent::new(RunEventKind::RunFailed, run_id)
                    .pipeline(state.pipeline_id)
                    .node(node_id)
                    .error(message),
            );
        }
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Cancel
    // -----------------------------------------------------------------------

    /// Stop a `PENDING` or `RUNNING` run.
    ///
    /// Poll tasks are stopped, open nodes are failed with
    /// [`CANCELLED_ERROR`], delegated jobs are asked to cancel (best
    /// effort) and the run fails with `{cancelled, cancelled_at}`.
    ///
    /// # Errors
    /// [`EngineError::InvalidRunState`] if the run already finished.
    #[instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<RunRow, EngineError> {
        let state = self.run_state(run_id).await?;
        let cancelled = {
            let _guard = state.lock.lock().await;
            self.cancel_locked(&state, run_id).await
        };
        self.release_if_finished(run_id).await?;
        cancelled?;
        Ok(self.inner.store.get_run(run_id).await?)
    }

    async fn cancel_locked(&self, state: &RunState, run_id: Uuid) -> Result<(), EngineError> {
        let store = &self.inner.store;

        let run = store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::InvalidRunState {
                run_id,
                status: run.status,
            });
        }

        let stopped = self.inner.polls.cancel_run(run_id);
        let failed = store.fail_open_node_runs(run_id, CANCELLED_ERROR).await?;
        info!(%run_id, polls = stopped, nodes = failed.len(), "cancelling run");

        for node in &failed {
            self.inner.events.publish(
                RunEvent::new(RunEventKind::NodeFailed, run_id)
                    .pipeline(state.pipeline_id)
                    .node(node.node_id.as_str())
                    .error(CANCELLED_ERROR),
            );
        }

        for job_id in failed.iter().filter_map(|n| n.job_id.as_deref()) {
            if let Err(err) = self.inner.board.cancel_job(job_id).await {
                warn!(%run_id, job_id, error = %err, "failed to cancel job");
            }
        }

        let cancelled_at = Utc::now();
        let applied = store
            .transition_run(
                run_id,
                &[RunStatus::Pending, RunStatus::Running],
                RunStatus::Failed,
                Some(json!({ "cancelled": true, "cancelled_at": cancelled_at })),
            )
            .await?;
        if applied {
            self.inner.events.publish(
                RunEvent::new(RunEventKind::RunFailed, run_id)
                    .pipeline(state.pipeline_id)
                    .error(CANCELLED_ERROR),
            );
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_run(&self, run_id: Uuid) -> Result<RunDetails, EngineError> {
        let store = &self.inner.store;
        let run = store
            .get_run(run_id)
            .await
            .or_not_found(|| EngineError::RunNotFound(run_id))?;
        let node_runs = store.list_node_runs(run_id).await?;
        Ok(RunDetails { run, node_runs })
    }

    /// Runs of a pipeline, newest first.
    pub async fn list_runs(&self, pipeline_id: Uuid) -> Result<Vec<RunRow>, EngineError> {
        let store = &self.inner.store;
        store
            .get_pipeline(pipeline_id)
            .await
            .or_not_found(|| EngineError::PipelineNotFound(pipeline_id))?;
        Ok(store.list_runs(pipeline_id).await?)
    }
}

/// `null` becomes `{}`; anything but an object is rejected.
fn normalize_input(input: Value) -> Result<Value, EngineError> {
    match input {
        Value::Null => Ok(Value::Object(Map::new())),
        Value::Object(_) => Ok(input),
        other => Err(EngineError::InvalidInput(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

/// The run input merged with the outputs of every completed node.
fn input_context(run_input: &Value, node_runs: &[NodeRunRow]) -> Value {
    let mut context = match run_input {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("input".into(), other.clone());
            map
        }
    };

    let outputs: Map<String, Value> = node_runs
        .iter()
        .filter(|n| n.status == NodeRunStatus::Completed)
        .map(|n| (n.node_id.clone(), n.output.clone().unwrap_or(Value::Null)))
        .collect();
    context.insert(NODE_OUTPUTS_KEY.into(), Value::Object(outputs));

    Value::Object(context)
}
