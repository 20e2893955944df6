//! `job` nodes: delegate the work to the external job board.

use std::sync::Arc;

use async_trait::async_trait;
use jobboard::{CreateJobRequest, JobBoard};
use serde_json::{Map, Value};
use tracing::info;

use crate::{ExecutableNode, ExecutionContext, NodeError, NodeOutcome};

/// Deployment-wide settings applied to every submitted job.
#[derive(Debug, Clone)]
pub struct JobDefaults {
    /// Tags used when a node's config has none.
    pub tags: Vec<String>,
    /// Where the board should push completion notifications, if anywhere.
    pub webhook_url: Option<String>,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            tags: vec!["dagwright".into(), "pipeline".into()],
            webhook_url: None,
        }
    }
}

/// Submits one job per execution and returns [`NodeOutcome::Delegated`].
///
/// Recognised `config` keys: `title`, `description`, `prompt`, `tags`,
/// `reward`, `metadata`.
pub struct JobNode {
    board: Arc<dyn JobBoard>,
    defaults: JobDefaults,
}

impl JobNode {
    pub fn new(board: Arc<dyn JobBoard>, defaults: JobDefaults) -> Self {
        Self { board, defaults }
    }

    /// Build the submission for the node described by `ctx`.
    pub fn build_request(&self, ctx: &ExecutionContext) -> Result<CreateJobRequest, NodeError> {
        let title = ctx
            .config_str("title")
            .unwrap_or(&ctx.label)
            .to_string();

        let description = ctx
            .config_str("description")
            .or_else(|| ctx.config_str("prompt"))
            .map(str::to_owned)
            .unwrap_or_else(|| format!("Execute node: {}", ctx.label));

        let tags = match ctx.config.get("tags") {
            None | Some(Value::Null) => self.defaults.tags.clone(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|t| {
                    t.as_str().map(str::to_owned).ok_or_else(|| {
                        NodeError::InvalidConfig(format!("tag {t} is not a string"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(other) => {
                return Err(NodeError::InvalidConfig(format!(
                    "tags must be an array of strings, got {other}"
                )))
            }
        };

        let reward = match ctx.config.get("reward") {
            None | Some(Value::Null) => 0.0,
            Some(v) => v.as_f64().ok_or_else(|| {
                NodeError::InvalidConfig(format!("reward must be a number, got {v}"))
            })?,
        };

        let mut metadata = match ctx.config.get("metadata") {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        metadata.insert("run_id".into(), Value::String(ctx.run_id.to_string()));
        metadata.insert("node_id".into(), Value::String(ctx.node_id.clone()));
        metadata.insert(
            "pipeline_id".into(),
            Value::String(ctx.pipeline_id.to_string()),
        );

        Ok(CreateJobRequest {
            title,
            description,
            tags,
            reward,
            kind: "task".into(),
            webhook_url: self.defaults.webhook_url.clone(),
            metadata,
        })
    }
}

#[async_trait]
impl ExecutableNode for JobNode {
    async fn execute(
        &self,
        _input: Value,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutcome, NodeError> {
        let request = self.build_request(ctx)?;
        let job_id = self.board.create_job(&request).await?;
        info!(run_id = %ctx.run_id, node_id = %ctx.node_id, %job_id, "job submitted");
        Ok(NodeOutcome::Delegated { job_id })
    }
}
