//! Engine tuning knobs.

use std::time::Duration;

/// Timings and limits used by the run controller and its poll tasks.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Delay between job status queries.
    pub poll_interval: Duration,
    /// Delay before retrying after a failed status query.
    pub poll_error_backoff: Duration,
    /// A job that is not terminal this long after its node started fails.
    pub max_poll_duration: Duration,
    /// Consecutive failed status queries tolerated before the node fails.
    pub max_poll_retries: u32,
    /// Events buffered per subscriber before the oldest are dropped.
    pub event_buffer: usize,
    /// Upper bound on nodes dispatched at once within a wave.
    /// `None` dispatches the whole wave concurrently.
    pub max_parallel_dispatch: Option<usize>,
}

impl EngineConfig {
    /// Defaults with a different poll interval; the error backoff follows
    /// at twice the interval.
    pub fn with_poll_interval(interval: Duration) -> Self {
        Self {
            poll_interval: interval,
            poll_error_backoff: interval * 2,
            ..Self::default()
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            poll_error_backoff: Duration::from_secs(10),
            max_poll_duration: Duration::from_secs(30 * 60),
            max_poll_retries: 3,
            event_buffer: 256,
            max_parallel_dispatch: None,
        }
    }
}
