//! HTTP implementation of [`JobBoard`].

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use crate::{CreateJobRequest, JobBoard, JobBoardError, JobSnapshot, Result};

/// Talks to the board's REST API with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpJobBoard {
    base_url: String,
    api_key: String,
    client: Client,
}

#[derive(Deserialize)]
struct CreatedJob {
    id: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

impl HttpJobBoard {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self::with_client(base_url, api_key, Client::new())
    }

    /// Use a preconfigured `reqwest::Client` (timeouts, proxies, TLS).
    pub fn with_client(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        client: Client,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check the status code and decode the JSON body.
    ///
    /// Error bodies of the form `{"error": "..."}` are folded into the
    /// error message.
    async fn handle_response<T: DeserializeOwned>(
        operation: &'static str,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .ok()
                .and_then(|b| b.error)
                .unwrap_or(text);
            return Err(JobBoardError::Api {
                operation,
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| JobBoardError::Parse(format!("{operation}: {e}")))
    }
}

#[async_trait]
impl JobBoard for HttpJobBoard {
    async fn create_job(&self, request: &CreateJobRequest) -> Result<String> {
        info!(title = %request.title, "creating job board job");
        let url = format!("{}/jobs", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        let created: CreatedJob = Self::handle_response("createJob", response).await?;
        info!(job_id = %created.id, "job board job created");
        Ok(created.id)
    }

    async fn get_job(&self, job_id: &str) -> Result<JobSnapshot> {
        let url = format!("{}/jobs/{}", self.base_url, job_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let snapshot: JobSnapshot = Self::handle_response("getJob", response).await?;
        debug!(job_id, status = %snapshot.status, "fetched job status");
        Ok(snapshot)
    }

    async fn cancel_job(&self, job_id: &str) -> Result<()> {
        let url = format!("{}/jobs/{}/cancel", self.base_url, job_id);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let _: serde_json::Value = Self::handle_response("cancelJob", response).await?;
        info!(job_id, "job board job cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_trailing_slash() {
        let board = HttpJobBoard::new("https://board.example/api/", "key");
        assert_eq!(board.base_url(), "https://board.example/api");
    }

    #[test]
    fn custom_client_is_accepted() {
        let board = HttpJobBoard::with_client("http://localhost:9000", "key", Client::new());
        assert_eq!(board.base_url(), "http://localhost:9000");
    }
}
