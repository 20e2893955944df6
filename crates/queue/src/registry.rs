//! Task registry with explicit register / cancel / list lifecycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::task::AbortHandle;
use tracing::debug;
use uuid::Uuid;

use crate::PollKey;

/// A background task handed to the registry.
pub type BoxTask = BoxFuture<'static, ()>;

/// Keeps at most one live task per [`PollKey`].
///
/// A task leaves the registry either by finishing on its own or by being
/// cancelled.  Cancelling a key that is not registered is a no-op.
pub trait TaskRegistry: Send + Sync {
    /// Start `task` under `key`.
    ///
    /// Returns `false` without starting anything when a task for `key` is
    /// still live.
    fn register(&self, key: PollKey, task: BoxTask) -> bool;

    /// Stop the task registered under `key`.  Returns whether one was live.
    fn cancel(&self, key: &PollKey) -> bool;

    /// Stop every task belonging to `run_id`.  Returns how many were live.
    fn cancel_run(&self, run_id: Uuid) -> usize;

    fn is_active(&self, key: &PollKey) -> bool;

    /// Live keys, sorted by run then node.
    fn active_keys(&self) -> Vec<PollKey>;

    fn active_count(&self) -> usize {
        self.active_keys().len()
    }
}

struct Entry {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct Inner {
    tasks: Mutex<HashMap<PollKey, Entry>>,
    next_generation: AtomicU64,
}

impl Inner {
    fn tasks(&self) -> MutexGuard<'_, HashMap<PollKey, Entry>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the entry for `key` only if it still belongs to `generation`;
    /// a newer registration under the same key must survive.
    fn finish(&self, key: &PollKey, generation: u64) {
        let mut tasks = self.tasks();
        if tasks.get(key).is_some_and(|e| e.generation == generation) {
            tasks.remove(key);
            debug!(%key, "poll task finished");
        }
    }
}

/// In-process registry backed by `tokio::spawn`.
///
/// Must be used from within a tokio runtime.
#[derive(Clone, Default)]
pub struct LocalTaskRegistry {
    inner: Arc<Inner>,
}

impl LocalTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskRegistry for LocalTaskRegistry {
    fn register(&self, key: PollKey, task: BoxTask) -> bool {
        // The lock is held across the spawn so a task that finishes
        // immediately cannot try to remove its entry before it exists.
        let mut tasks = self.inner.tasks();
        if tasks.contains_key(&key) {
            debug!(%key, "poll task already active");
            return false;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let own_key = key.clone();
        let handle = tokio::spawn(async move {
            task.await;
            inner.finish(&own_key, generation);
        });

        debug!(%key, generation, "poll task registered");
        tasks.insert(
            key,
            Entry {
                generation,
                handle: handle.abort_handle(),
            },
        );
        true
    }

    fn cancel(&self, key: &PollKey) -> bool {
        match self.inner.tasks().remove(key) {
            Some(entry) => {
                entry.handle.abort();
                debug!(%key, "poll task cancelled");
                true
            }
            None => false,
        }
    }

    fn cancel_run(&self, run_id: Uuid) -> usize {
        let mut tasks = self.inner.tasks();
        let keys: Vec<PollKey> = tasks
            .keys()
            .filter(|k| k.run_id == run_id)
            .cloned()
            .collect();

        for key in &keys {
            if let Some(entry) = tasks.remove(key) {
                entry.handle.abort();
            }
        }
        debug!(%run_id, cancelled = keys.len(), "poll tasks cancelled for run");
        keys.len()
    }

    fn is_active(&self, key: &PollKey) -> bool {
        self.inner.tasks().contains_key(key)
    }

    fn active_keys(&self) -> Vec<PollKey> {
        let mut keys: Vec<PollKey> = self.inner.tasks().keys().cloned().collect();
        keys.sort_by(|a, b| (a.run_id, &a.node_id).cmp(&(b.run_id, &b.node_id)));
        keys
    }
}
