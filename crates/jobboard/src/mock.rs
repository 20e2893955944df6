//! `MockJobBoard`: a scripted, in-memory job board for tests.
//!
//! Job ids are handed out as `job-1`, `job-2`, … in creation order.  Each
//! job answers `get_job` from its script; the last scripted reply repeats
//! forever.  Unscripted jobs report `in_progress`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::{CreateJobRequest, JobBoard, JobBoardError, JobSnapshot, JobStatus, Result};

/// One scripted answer to `get_job`.
#[derive(Debug, Clone)]
pub enum MockReply {
    Status {
        status: JobStatus,
        progress: Option<f64>,
        result: Option<Value>,
        error: Option<String>,
    },
    /// The query itself fails (transport or 5xx).
    QueryError(String),
}

impl MockReply {
    pub fn status(status: JobStatus) -> Self {
        Self::Status {
            status,
            progress: None,
            result: None,
            error: None,
        }
    }

    pub fn progress(percent: f64) -> Self {
        Self::Status {
            status: JobStatus::InProgress,
            progress: Some(percent),
            result: None,
            error: None,
        }
    }

    pub fn completed(result: Value) -> Self {
        Self::Status {
            status: JobStatus::Completed,
            progress: Some(100.0),
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::Status {
            status: JobStatus::Failed,
            progress: None,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn query_error(message: impl Into<String>) -> Self {
        Self::QueryError(message.into())
    }

    fn into_result(self, job_id: &str) -> Result<JobSnapshot> {
        match self {
            Self::Status {
                status,
                progress,
                result,
                error,
            } => {
                let mut snapshot = JobSnapshot::new(job_id, status);
                snapshot.progress = progress;
                snapshot.result = result;
                snapshot.error = error;
                Ok(snapshot)
            }
            Self::QueryError(message) => Err(JobBoardError::Api {
                operation: "getJob",
                status: 503,
                message,
            }),
        }
    }
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    create_error: Option<String>,
    created: Vec<CreateJobRequest>,
    scripts: HashMap<String, VecDeque<MockReply>>,
    polls: HashMap<String, usize>,
    cancelled: Vec<String>,
}

#[derive(Default)]
pub struct MockJobBoard {
    state: Mutex<MockState>,
}

impl MockJobBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// A board that rejects every job submission with `message`.
    pub fn failing_create(message: impl Into<String>) -> Self {
        let board = Self::default();
        board.state().create_error = Some(message.into());
        board
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue replies for `job_id`.  May be called before the job exists.
    pub fn script(&self, job_id: impl Into<String>, replies: Vec<MockReply>) {
        self.state()
            .scripts
            .entry(job_id.into())
            .or_default()
            .extend(replies);
    }

    /// Every accepted creation request, in order.
    pub fn created(&self) -> Vec<CreateJobRequest> {
        self.state().created.clone()
    }

    pub fn poll_count(&self, job_id: &str) -> usize {
        self.state().polls.get(job_id).copied().unwrap_or(0)
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state().cancelled.clone()
    }
}

#[async_trait]
impl JobBoard for MockJobBoard {
    async fn create_job(&self, request: &CreateJobRequest) -> Result<String> {
        let mut state = self.state();
        if let Some(message) = &state.create_error {
            return Err(JobBoardError::Api {
                operation: "createJob",
                status: 500,
                message: message.clone(),
            });
        }
        state.next_id += 1;
        state.created.push(request.clone());
        Ok(format!("job-{}", state.next_id))
    }

    async fn get_job(&self, job_id: &str) -> Result<JobSnapshot> {
        let reply = {
            let mut state = self.state();
            *state.polls.entry(job_id.to_owned()).or_default() += 1;
            match state.scripts.get_mut(job_id) {
                Some(script) if script.len() > 1 => script.pop_front(),
                Some(script) => script.front().cloned(),
                None => None,
            }
        };
        reply
            .unwrap_or_else(|| MockReply::status(JobStatus::InProgress))
            .into_result(job_id)
    }

    async fn cancel_job(&self, job_id: &str) -> Result<()> {
        self.state().cancelled.push(job_id.to_owned());
        Ok(())
    }
}
