//! `MockNode`: a test double for `ExecutableNode`.
//!
//! Useful in unit and integration tests where a real node implementation is
//! either unavailable or irrelevant.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, PoisonError};

use crate::{traits::ExecutionContext, ExecutableNode, NodeError, NodeOutcome};

/// Behaviour injected into `MockNode` at construction time.
pub enum MockBehaviour {
    /// Complete with a specific JSON value.
    ReturnValue(Value),
    /// Pretend a job was created with this id.
    Delegate(String),
    /// Fail with an `Other` error.
    Fail(String),
}

/// A mock node that records every call it receives and returns a
/// programmer-specified result.
pub struct MockNode {
    /// Label used in test assertions.
    pub name: String,
    /// What the node will do when `execute` is called.
    pub behaviour: MockBehaviour,
    /// `(node_id, input)` of every call, in call order.
    pub calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl MockNode {
    /// Create a mock that always completes with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that always reports a delegated job.
    pub fn delegating(name: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::Delegate(job_id.into()))
    }

    /// Create a mock that always fails.
    pub fn failing(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::Fail(msg.into()))
    }

    fn with(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of times this node has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Node ids this mock was executed for, in call order.
    pub fn called_for(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl ExecutableNode for MockNode {
    async fn execute(
        &self,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutcome, NodeError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((ctx.node_id.clone(), input));

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => {
                // Tag the output with the mock's name so tests can trace
                // which node produced it.
                let mut out = json!({ "node": self.name });
                if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), v.as_object()) {
                    for (k, val) in v_obj {
                        out_obj.insert(k.clone(), val.clone());
                    }
                }
                Ok(NodeOutcome::Completed(out))
            }
            MockBehaviour::Delegate(job_id) => Ok(NodeOutcome::Delegated {
                job_id: job_id.clone(),
            }),
            MockBehaviour::Fail(msg) => Err(NodeError::Other(msg.clone())),
        }
    }
}
