//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models; they carry no domain behaviour.
//! Domain types live in the `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// pipelines
// ---------------------------------------------------------------------------

/// A persisted pipeline definition row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PipelineRow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Full JSON pipeline definition (nodes, edges).
    pub definition: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// runs
// ---------------------------------------------------------------------------

/// Possible statuses for a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING"   => Ok(Self::Pending),
            "RUNNING"   => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED"    => Ok(Self::Failed),
            other       => Err(format!("unknown run status: {other}")),
        }
    }
}

/// A persisted pipeline run row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRow {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub status: RunStatus,
    /// Input context supplied when the run was started.
    pub input: Value,
    /// Aggregated node outputs on success, failure cause otherwise.
    pub output: Option<Value>,
    /// Snapshot of the pipeline definition the run executes.
    pub definition: Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// node_runs
// ---------------------------------------------------------------------------

/// Possible statuses for a node run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeRunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl std::fmt::Display for NodeRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeRunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING"   => Ok(Self::Pending),
            "RUNNING"   => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED"    => Ok(Self::Failed),
            "SKIPPED"   => Ok(Self::Skipped),
            other       => Err(format!("unknown node run status: {other}")),
        }
    }
}

/// A persisted node run row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRunRow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    pub status: NodeRunStatus,
    /// Job board id, set once the node delegated its work.
    pub job_id: Option<String>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The new state applied by a conditional node run update.
///
/// `started_at` is stamped when moving to `RUNNING`, `completed_at` when
/// moving to a terminal status.  `None` fields leave the column untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRunTransition {
    pub to: NodeRunStatus,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl NodeRunTransition {
    pub fn start(input: Value) -> Self {
        Self {
            to: NodeRunStatus::Running,
            input: Some(input),
            output: None,
            error: None,
        }
    }

    pub fn complete(output: Value) -> Self {
        Self {
            to: NodeRunStatus::Completed,
            input: None,
            output: Some(output),
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            to: NodeRunStatus::Failed,
            input: None,
            output: None,
            error: Some(error.into()),
        }
    }
}
