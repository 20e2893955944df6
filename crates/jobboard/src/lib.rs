//! `jobboard` crate: client side of the external job board.
//!
//! `job` nodes delegate their work to the board: they create a job, then the
//! engine observes it through [`JobBoard::get_job`] polling or through the
//! board's webhook.  Only the job lifecycle matters here.

pub mod client;
pub mod error;
pub mod mock;
pub mod types;

pub use client::HttpJobBoard;
pub use error::{JobBoardError, Result};
pub use types::{CreateJobRequest, JobSnapshot, JobStatus, JobWebhook};

use async_trait::async_trait;

/// Operations the engine needs from a job board.
#[async_trait]
pub trait JobBoard: Send + Sync {
    /// Submit a new job and return its board-assigned identifier.
    async fn create_job(&self, request: &CreateJobRequest) -> Result<String>;

    /// Fetch the current state of a job.
    async fn get_job(&self, job_id: &str) -> Result<JobSnapshot>;

    /// Ask the board to cancel a job.  Best effort.
    async fn cancel_job(&self, job_id: &str) -> Result<()>;
}
