//! Error types for the job board client.

use thiserror::Error;

/// Result type alias for job board operations.
pub type Result<T> = std::result::Result<T, JobBoardError>;

#[derive(Debug, Error)]
pub enum JobBoardError {
    /// Transport-level failure.
    #[error("job board request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The board answered with a non-success status.
    #[error("job board {operation} failed with status {status}: {message}")]
    Api {
        operation: &'static str,
        status: u16,
        message: String,
    },

    /// The response body did not have the expected shape.
    #[error("failed to parse job board response: {0}")]
    Parse(String),
}

impl JobBoardError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }
}
