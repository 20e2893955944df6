//! Identity of a poll task.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies the poll task for one node of one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PollKey {
    pub run_id: Uuid,
    pub node_id: String,
}

impl PollKey {
    pub fn new(run_id: Uuid, node_id: impl Into<String>) -> Self {
        Self {
            run_id,
            node_id: node_id.into(),
        }
    }
}

/// Rendered as `{run_id}:{node_id}`.
impl fmt::Display for PollKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.run_id, self.node_id)
    }
}
