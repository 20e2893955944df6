//! Wire types exchanged with the job board.
//!
//! The board speaks camelCase JSON.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle state reported by the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobStatus {
    Open,
    InProgress,
    Completed,
    Done,
    Failed,
    Cancelled,
    /// Anything the board reports that is not part of the known vocabulary.
    Other(String),
}

impl JobStatus {
    /// `completed` or `done`.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Done)
    }

    /// `failed` or `cancelled`.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }

    pub fn is_terminal(&self) -> bool {
        self.is_success() || self.is_failure()
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "open" => Self::Open,
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            "done" => Self::Done,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Other(s),
        }
    }
}

impl From<JobStatus> for String {
    fn from(status: JobStatus) -> Self {
        status.as_str().to_owned()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Requests / responses
// ---------------------------------------------------------------------------

/// Body of a job creation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub reward: f64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// The subset of a board job the engine cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub submissions: Option<Vec<Value>>,
}

impl JobSnapshot {
    pub fn new(id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            id: id.into(),
            status,
            progress: None,
            result: None,
            output: None,
            error: None,
            submissions: None,
        }
    }

    /// `result` if the board filled it, otherwise `output`.
    pub fn result_or_output(&self) -> Option<&Value> {
        self.result.as_ref().or(self.output.as_ref())
    }
}

/// Inbound webhook notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobWebhook {
    #[serde(alias = "job_id")]
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_vocabulary_parses() {
        let parsed: Vec<JobStatus> =
            serde_json::from_value(json!(["open", "in_progress", "done", "cancelled"])).unwrap();
        assert_eq!(
            parsed,
            vec![
                JobStatus::Open,
                JobStatus::InProgress,
                JobStatus::Done,
                JobStatus::Cancelled
            ]
        );
        assert!(parsed[2].is_success());
        assert!(parsed[3].is_failure());
        assert!(!parsed[1].is_terminal());
    }

    #[test]
    fn unknown_status_keeps_its_text() {
        let status: JobStatus = serde_json::from_value(json!("under_review")).unwrap();
        assert_eq!(status, JobStatus::Other("under_review".into()));
        assert!(!status.is_terminal());
        assert_eq!(status.to_string(), "under_review");
    }

    #[test]
    fn create_request_uses_board_field_names() {
        let req = CreateJobRequest {
            title: "t".into(),
            description: "d".into(),
            tags: vec!["pipeline".into()],
            reward: 0.0,
            kind: "task".into(),
            webhook_url: Some("http://hook".into()),
            metadata: Map::new(),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["type"], "task");
        assert_eq!(v["webhookUrl"], "http://hook");
        assert!(v.get("metadata").is_none());
    }

    #[test]
    fn snapshot_falls_back_to_output() {
        let snap: JobSnapshot = serde_json::from_value(json!({
            "id": "j1",
            "status": "completed",
            "output": {"answer": 42},
        }))
        .unwrap();
        assert_eq!(snap.result_or_output(), Some(&json!({"answer": 42})));
    }

    #[test]
    fn webhook_accepts_both_id_spellings() {
        let a: JobWebhook = serde_json::from_value(json!({"jobId": "j", "status": "done"})).unwrap();
        let b: JobWebhook = serde_json::from_value(json!({"job_id": "j", "status": "done"})).unwrap();
        assert_eq!(a, b);
    }
}
