//! Run progress events and the in-process bus that fans them out.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunEventKind {
    #[serde(rename = "run:started")]
    RunStarted,
    #[serde(rename = "run:completed")]
    RunCompleted,
    #[serde(rename = "run:failed")]
    RunFailed,
    #[serde(rename = "node:started")]
    NodeStarted,
    #[serde(rename = "node:completed")]
    NodeCompleted,
    #[serde(rename = "node:failed")]
    NodeFailed,
    #[serde(rename = "job:created")]
    JobCreated,
    #[serde(rename = "job:progress")]
    JobProgress,
}

impl RunEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run:started",
            Self::RunCompleted => "run:completed",
            Self::RunFailed => "run:failed",
            Self::NodeStarted => "node:started",
            Self::NodeCompleted => "node:completed",
            Self::NodeFailed => "node:failed",
            Self::JobCreated => "job:created",
            Self::JobProgress => "job:progress",
        }
    }
}

impl fmt::Display for RunEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a run's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    #[serde(rename = "type")]
    pub kind: RunEventKind,
    pub run_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl RunEvent {
    pub fn new(kind: RunEventKind, run_id: Uuid) -> Self {
        Self {
            kind,
            run_id,
            pipeline_id: None,
            node_id: None,
            job_id: None,
            error: None,
            output: None,
            progress: None,
            timestamp: Utc::now(),
        }
    }

    pub fn pipeline(mut self, pipeline_id: Uuid) -> Self {
        self.pipeline_id = Some(pipeline_id);
        self
    }

    pub fn node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// What a subscriber listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Events of one run.
    Run(Uuid),
    /// Every event of every run.
    All,
}

/// Publish/subscribe keyed by run id, plus a wildcard topic.
///
/// Each topic is a `tokio::sync::broadcast` channel, so every subscriber has
/// its own bounded queue of `capacity` events.  A subscriber that falls
/// behind loses the oldest events; publishers never wait.
type Topics = RwLock<HashMap<Topic, broadcast::Sender<RunEvent>>>;

#[derive(Clone)]
pub struct EventBus {
    topics: Arc<Topics>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::default(),
            capacity: capacity.max(1),
        }
    }

    /// Deliver `event` to its run's subscribers and to wildcard subscribers.
    pub fn publish(&self, event: RunEvent) {
        debug!(run_id = %event.run_id, kind = %event.kind, "event");
        let targets = [Topic::Run(event.run_id), Topic::All];

        let mut orphaned = Vec::new();
        {
            let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
            for topic in targets {
                if let Some(tx) = topics.get(&topic) {
                    if tx.send(event.clone()).is_err() {
                        orphaned.push(topic);
                    }
                }
            }
        }

        if !orphaned.is_empty() {
            let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
            for topic in orphaned {
                // A subscriber may have arrived since the failed send.
                if topics.get(&topic).is_some_and(|tx| tx.receiver_count() == 0) {
                    topics.remove(&topic);
                }
            }
        }
    }

    /// Start receiving events for `topic`.  Dropping the subscription
    /// unsubscribes.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        let rx = topics
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        Subscription {
            topic,
            rx,
            topics: Arc::downgrade(&self.topics),
        }
    }

    /// Run `callback` for every event on `topic` until the handle is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe_with<F>(&self, topic: Topic, callback: F) -> SubscriptionHandle
    where
        F: Fn(RunEvent) + Send + 'static,
    {
        let mut subscription = self.subscribe(topic);
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                callback(event);
            }
        });
        SubscriptionHandle { task }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&topic)
            .map_or(0, |tx| tx.receiver_count())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// A live subscription to one [`Topic`].  The last subscription of a topic
/// removes it from the bus when dropped.
pub struct Subscription {
    topic: Topic,
    rx: broadcast::Receiver<RunEvent>,
    topics: Weak<Topics>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Wait for the next event.  Returns `None` once the bus is gone.
    ///
    /// Events dropped because this subscriber lagged are skipped with a
    /// warning.
    pub async fn recv(&mut self) -> Option<RunEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(topic = ?self.topic, skipped, "slow event subscriber dropped events");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// The next already-queued event, if any.
    pub fn try_recv(&mut self) -> Option<RunEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(topic = ?self.topic, skipped, "slow event subscriber dropped events");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = RunEvent> + Send + 'static {
        stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(topics) = self.topics.upgrade() else {
            return;
        };
        let mut topics = topics.write().unwrap_or_else(PoisonError::into_inner);
        // `self.rx` is still alive here, so a count of one means us alone.
        if topics
            .get(&self.topic)
            .is_some_and(|tx| tx.receiver_count() <= 1)
        {
            topics.remove(&self.topic);
            debug!(topic = ?self.topic, "topic released");
        }
    }
}

/// Keeps a callback subscription alive; dropping it unsubscribes.
pub struct SubscriptionHandle {
    task: JoinHandle<()>,
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
