//! Completion tracking for delegated nodes: poll tasks and webhooks.
//!
//! A poll task never applies its own verdict.  Once it sees a terminal
//! state it hands the verdict to a detached task and returns, so aborting a
//! poll (webhook arrival, run failure, cancellation) can never interrupt a
//! half-applied completion.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use jobboard::{JobSnapshot, JobWebhook};
use queue::PollKey;

use crate::controller::RunController;
use crate::events::{RunEvent, RunEventKind};
use crate::EngineError;

/// Error recorded when a job outlives the maximum poll duration.
pub const TIMEOUT_ERROR: &str = "Job timed out";

/// The final word on a delegated node.
#[derive(Debug, Clone, PartialEq)]
enum Verdict {
    Complete(Value),
    Fail(String),
}

/// What a webhook delivery did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// No node run delegated to this job.
    UnknownJob,
    Completed,
    Failed,
    /// Terminal status for a node that had already finished.
    Stale,
    /// Non-terminal status; polling carries on.
    Acknowledged,
}

/// Snapshot of the poll registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollingStatus {
    pub active_count: usize,
    /// `{run_id}:{node_id}` of every live poll task.
    pub keys: Vec<String>,
}

impl RunController {
    /// Start polling `job_id` for one node.  Returns `false` if a poll task
    /// for that node is already live.
    ///
    /// `started_at` is when the node started; the poll gives up
    /// `max_poll_duration` after it.
    pub fn register_poll(
        &self,
        run_id: Uuid,
        node_id: &str,
        job_id: &str,
        started_at: DateTime<Utc>,
    ) -> bool {
        let max = self.inner.config.max_poll_duration;
        let elapsed = (Utc::now() - started_at).to_std().unwrap_or(Duration::ZERO);
        let deadline = Instant::now() + max.saturating_sub(elapsed);

        let key = PollKey::new(run_id, node_id);
        let task = self.clone().poll_job(key.clone(), job_id.to_owned(), deadline);
        let registered = self.inner.polls.register(key, Box::pin(task));
        if registered {
            debug!(%run_id, node_id, job_id, "poll registered");
        }
        registered
    }

    async fn poll_job(self, key: PollKey, job_id: String, deadline: Instant) {
        let verdict = self.watch_job(&key, &job_id, deadline).await;

        tokio::spawn(async move {
            let PollKey { run_id, node_id } = key;
            let applied = match verdict {
                Verdict::Complete(output) => self.complete_node(run_id, &node_id, output).await,
                Verdict::Fail(reason) => self.fail_node(run_id, &node_id, &reason).await,
            };
            if let Err(err) = applied {
                error!(%run_id, node_id, error = %err, "failed to apply poll verdict");
            }
        });
    }

    /// Tick until the job reaches a verdict.  The first tick is immediate.
    async fn watch_job(&self, key: &PollKey, job_id: &str, deadline: Instant) -> Verdict {
        let config = &self.inner.config;
        let mut consecutive_errors = 0u32;

        loop {
            if Instant::now() >= deadline {
                warn!(%key, job_id, "job polling timed out");
                return Verdict::Fail(TIMEOUT_ERROR.to_owned());
            }

            let delay = match self.inner.board.get_job(job_id).await {
                Ok(snapshot) => {
                    consecutive_errors = 0;
                    self.inner.events.publish(
                        RunEvent::new(RunEventKind::JobProgress, key.run_id)
                            .node(key.node_id.as_str())
                            .job(job_id)
                            .progress(snapshot.progress.unwrap_or(0.0)),
                    );

                    if let Some(verdict) = verdict_from_snapshot(job_id, &snapshot) {
                        info!(%key, job_id, status = %snapshot.status, "job finished");
                        return verdict;
                    }
                    debug!(%key, job_id, status = %snapshot.status, "job still running");
                    config.poll_interval
                }
                Err(err) => {
                    consecutive_errors += 1;
                    if consecutive_errors > config.max_poll_retries {
                        return Verdict::Fail(format!("Failed to poll job status: {err}"));
                    }
                    warn!(
                        %key,
                        job_id,
                        attempt = consecutive_errors,
                        max = config.max_poll_retries,
                        error = %err,
                        "job status query failed"
                    );
                    config.poll_error_backoff
                }
            };

            tokio::time::sleep(delay).await;
        }
    }

    // -----------------------------------------------------------------------
    // Webhooks
    // -----------------------------------------------------------------------

    /// Apply a job board notification.
    ///
    /// Unknown jobs and non-terminal statuses change nothing.  A terminal
    /// status stops the node's poll task and goes through the same
    /// completion / failure handlers as polling.
    pub async fn handle_webhook(&self, payload: JobWebhook) -> Result<WebhookOutcome, EngineError> {
        let Some(node_run) = self
            .inner
            .store
            .find_node_run_by_job(&payload.job_id)
            .await?
        else {
            debug!(job_id = %payload.job_id, "webhook for unknown job");
            return Ok(WebhookOutcome::UnknownJob);
        };

        let (run_id, node_id) = (node_run.run_id, node_run.node_id);
        if !payload.status.is_terminal() {
            debug!(%run_id, node_id, status = %payload.status, "webhook acknowledged");
            return Ok(WebhookOutcome::Acknowledged);
        }

        self.inner.polls.cancel(&PollKey::new(run_id, node_id.as_str()));
        info!(%run_id, node_id, job_id = %payload.job_id, status = %payload.status, "webhook received");

        if payload.status.is_success() {
            let output = json!({
                "job_id": payload.job_id,
                "result": payload.result,
                "webhook_received": true,
            });
            let applied = self.complete_node(run_id, &node_id, output).await?;
            Ok(if applied { WebhookOutcome::Completed } else { WebhookOutcome::Stale })
        } else {
            let reason = payload
                .error
                .unwrap_or_else(|| format!("Job {}", payload.status));
            let applied = self.fail_node(run_id, &node_id, &reason).await?;
            Ok(if applied { WebhookOutcome::Failed } else { WebhookOutcome::Stale })
        }
    }

    // -----------------------------------------------------------------------
    // Polling control
    // -----------------------------------------------------------------------

    pub fn polling_status(&self) -> PollingStatus {
        let keys = self.inner.polls.active_keys();
        PollingStatus {
            active_count: keys.len(),
            keys: keys.iter().map(ToString::to_string).collect(),
        }
    }

    /// Re-register poll tasks for every node still waiting on a job in a
    /// running run, e.g. after a restart.  Returns how many were started.
    pub async fn resume_polling(&self) -> Result<usize, EngineError> {
        let inflight = self.inner.store.list_inflight_jobs().await?;
        let mut resumed = 0;
        for node_run in inflight {
            let Some(job_id) = node_run.job_id.as_deref() else {
                continue;
            };
            let started_at = node_run.started_at.unwrap_or_else(Utc::now);
            if self.register_poll(node_run.run_id, &node_run.node_id, job_id, started_at) {
                resumed += 1;
            }
        }
        info!(resumed, "polling resumed");
        Ok(resumed)
    }
}

fn verdict_from_snapshot(job_id: &str, snapshot: &JobSnapshot) -> Option<Verdict> {
    if snapshot.status.is_success() {
        return Some(Verdict::Complete(json!({
            "job_id": job_id,
            "result": snapshot.result_or_output(),
            "submissions": snapshot.submissions,
        })));
    }
    if snapshot.status.is_failure() {
        let reason = snapshot
            .error
            .clone()
            .unwrap_or_else(|| format!("Job {}", snapshot.status));
        return Some(Verdict::Fail(reason));
    }
    None
}
