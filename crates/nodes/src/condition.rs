//! `condition` nodes: evaluate `config.condition` against the input context.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;

use crate::expr;
use crate::{ExecutableNode, ExecutionContext, NodeError, NodeOutcome};

/// Output key carrying the evaluated condition.
pub const CONDITION_RESULT_KEY: &str = "condition_result";

/// Evaluates its condition and completes with
/// `{ ..input, "condition_result": bool }`.
///
/// A missing or blank condition counts as `true`.  So does a condition that
/// fails to parse or evaluate; the failure is logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionNode;

impl ConditionNode {
    fn evaluate(ctx: &ExecutionContext, input: &Value) -> bool {
        let Some(condition) = ctx.config_str("condition") else {
            return true;
        };

        match expr::evaluate_bool(condition, input) {
            Ok(result) => result,
            Err(err) => {
                warn!(
                    node_id = %ctx.node_id,
                    condition,
                    error = %err,
                    "condition evaluation failed, defaulting to true"
                );
                true
            }
        }
    }
}

#[async_trait]
impl ExecutableNode for ConditionNode {
    async fn execute(
        &self,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutcome, NodeError> {
        let result = Self::evaluate(ctx, &input);

        let mut output = match input {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".into(), other);
                map
            }
        };
        output.insert(CONDITION_RESULT_KEY.into(), Value::Bool(result));
        Ok(NodeOutcome::Completed(Value::Object(output)))
    }
}
