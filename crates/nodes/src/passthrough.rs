//! `start` / `end` nodes: complete immediately with their input.

use async_trait::async_trait;
use serde_json::Value;

use crate::{ExecutableNode, ExecutionContext, NodeError, NodeOutcome};

/// Forwards the input context unchanged.
///
/// Entry nodes use it to seed the graph with the run input; exit nodes use
/// it to collect everything upstream for the final aggregation.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughNode;

#[async_trait]
impl ExecutableNode for PassThroughNode {
    async fn execute(
        &self,
        input: Value,
        _ctx: &ExecutionContext,
    ) -> Result<NodeOutcome, NodeError> {
        Ok(NodeOutcome::Completed(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn output_equals_input() {
        let ctx = ExecutionContext {
            pipeline_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            node_id: "start".into(),
            label: "Start".into(),
            config: Value::Null,
        };
        let input = json!({ "topic": "rust" });
        let outcome = PassThroughNode.execute(input.clone(), &ctx).await.unwrap();
        assert_eq!(outcome, NodeOutcome::Completed(input));
    }
}
