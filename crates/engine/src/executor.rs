//! Node execution.
//!
//! `NodeExecutor::dispatch` moves one node from `PENDING` to `RUNNING`,
//! runs its implementation through the [`NodeRegistry`], and reports what
//! happened.  It never marks a node completed or failed itself; the run
//! controller applies the result under the run lock.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use db::models::{NodeRunStatus, NodeRunTransition};
use db::Store;
use jobboard::JobBoard;
use nodes::{
    ConditionNode, ExecutableNode, ExecutionContext, JobDefaults, JobNode, NodeOutcome,
    PassThroughNode,
};

use crate::events::{EventBus, RunEvent, RunEventKind};
use crate::models::{Node, NodeType};

// ---------------------------------------------------------------------------
// Node registry
// ---------------------------------------------------------------------------

/// Maps each [`NodeType`] to the implementation that executes it.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: HashMap<NodeType, Arc<dyn ExecutableNode>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in kinds: start/end pass through, conditions evaluate,
    /// jobs go to `board`.
    pub fn standard(board: Arc<dyn JobBoard>, defaults: JobDefaults) -> Self {
        let passthrough: Arc<dyn ExecutableNode> = Arc::new(PassThroughNode);
        Self::new()
            .with(NodeType::Start, Arc::clone(&passthrough))
            .with(NodeType::End, passthrough)
            .with(NodeType::Condition, Arc::new(ConditionNode))
            .with(NodeType::Job, Arc::new(JobNode::new(board, defaults)))
    }

    pub fn with(mut self, node_type: NodeType, node: Arc<dyn ExecutableNode>) -> Self {
        self.nodes.insert(node_type, node);
        self
    }

    pub fn get(&self, node_type: NodeType) -> Option<&Arc<dyn ExecutableNode>> {
        self.nodes.get(&node_type)
    }
}

// ---------------------------------------------------------------------------
// Dispatch result
// ---------------------------------------------------------------------------

/// What a single dispatch produced.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Dispatched {
    /// The node was no longer `PENDING`; nothing ran.
    Skipped,
    Completed(Value),
    Delegated(String),
    Failed(String),
}

/// Identity of the run a node belongs to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunRef {
    pub run_id: Uuid,
    pub pipeline_id: Uuid,
}

// ---------------------------------------------------------------------------
// NodeExecutor
// ---------------------------------------------------------------------------

pub(crate) struct NodeExecutor {
    store: Arc<dyn Store>,
    registry: NodeRegistry,
    events: EventBus,
}

impl NodeExecutor {
    pub fn new(store: Arc<dyn Store>, registry: NodeRegistry, events: EventBus) -> Self {
        Self {
            store,
            registry,
            events,
        }
    }

    pub async fn dispatch(&self, run: RunRef, node: &Node, input: Value) -> Dispatched {
        let node_id = node.node_id.as_str();

        let claimed = self
            .store
            .transition_node_run(
                run.run_id,
                node_id,
                &[NodeRunStatus::Pending],
                NodeRunTransition::start(input.clone()),
            )
            .await;
        match claimed {
            Ok(true) => {}
            Ok(false) => {
                debug!(run_id = %run.run_id, node_id, "node already claimed");
                return Dispatched::Skipped;
            }
            Err(err) => return Dispatched::Failed(err.to_string()),
        }

        self.events.publish(
            RunEvent::new(RunEventKind::NodeStarted, run.run_id)
                .pipeline(run.pipeline_id)
                .node(node_id),
        );
        info!(run_id = %run.run_id, node_id, node_type = node.node_type.as_str(), "node started");

        let Some(implementation) = self.registry.get(node.node_type) else {
            return Dispatched::Failed(format!(
                "no implementation registered for node type '{}'",
                node.node_type.as_str()
            ));
        };

        let ctx = ExecutionContext {
            pipeline_id: run.pipeline_id,
            run_id: run.run_id,
            node_id: node.node_id.clone(),
            label: node.display_label().to_owned(),
            config: node.config.clone(),
        };

        match implementation.execute(input, &ctx).await {
            Ok(NodeOutcome::Completed(output)) => Dispatched::Completed(output),
            Ok(NodeOutcome::Delegated { job_id }) => {
                if let Err(err) = self.store.set_node_job(run.run_id, node_id, &job_id).await {
                    warn!(run_id = %run.run_id, node_id, %job_id, error = %err, "failed to record job id");
                    return Dispatched::Failed(err.to_string());
                }
                self.events.publish(
                    RunEvent::new(RunEventKind::JobCreated, run.run_id)
                        .pipeline(run.pipeline_id)
                        .node(node_id)
                        .job(job_id.as_str()),
                );
                info!(run_id = %run.run_id, node_id, %job_id, "job created");
                Dispatched::Delegated(job_id)
            }
            Err(err) => Dispatched::Failed(err.to_string()),
        }
    }
}
