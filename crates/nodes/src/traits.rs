//! The `ExecutableNode` trait: the contract every node kind must fulfil.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::NodeError;

/// Identity and configuration of the node being executed.
///
/// Defined here (in the nodes crate) so both the engine and individual node
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub pipeline_id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    pub label: String,
    /// The node's free-form `config` map from the pipeline definition.
    pub config: Value,
}

impl ExecutionContext {
    /// String field of `config`, if present and non-empty.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }
}

/// What happened when a node was executed.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// The node finished on the spot with this output.
    Completed(Value),
    /// Work was handed to the job board; completion arrives later.
    Delegated { job_id: String },
}

/// The core node trait.
#[async_trait]
pub trait ExecutableNode: Send + Sync {
    /// Execute the node against the merged input context.
    ///
    /// Implementations must not block on external completion: delegate and
    /// return [`NodeOutcome::Delegated`] instead.
    async fn execute(
        &self,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutcome, NodeError>;
}
