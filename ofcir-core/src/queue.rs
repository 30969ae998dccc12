//! Work queue with per-key single-flight and rate-limited retries.
//!
//! Keys arrive from watch events, resync ticks and requeue requests. A key
//! is delivered at most once at a time: if it shows up while its reconcile
//! is in flight it is parked and re-delivered as soon as the current run
//! finishes. Failed keys back off exponentially until the first success.
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use ofcir_model::ObjectKey;

use crate::metrics::WORKQUEUE_DEPTH;

/// First retry delay after a failed reconcile
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Retry delay ceiling
const BACKOFF_MAX: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct WorkQueue {
    name: &'static str,
    inner: Arc<Inner>,
}

struct Inner {
    state: std::sync::Mutex<QueueState>,
    notify: Notify,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<ObjectKey>,
    /// keys currently in `ready`
    queued: HashSet<ObjectKey>,
    /// keys with a reconcile in flight
    active: HashSet<ObjectKey>,
    /// keys that arrived while active; re-delivered on `done`
    rerun: HashSet<ObjectKey>,
    /// consecutive failures per key
    failures: HashMap<ObjectKey, u32>,
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().expect("workqueue lock poisoned");
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .field("ready", &state.ready.len())
            .field("active", &state.active.len())
            .finish()
    }
}

impl WorkQueue {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(Inner {
                state: std::sync::Mutex::new(QueueState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Add a key for delivery. No-op when the key is already waiting;
    /// parked for re-delivery when the key is currently being reconciled.
    pub fn enqueue(&self, key: ObjectKey) {
        let mut state = self.inner.state.lock().expect("workqueue lock poisoned");
        if state.active.contains(&key) {
            trace!(queue = self.name, %key, "key active, parking for rerun");
            state.rerun.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.ready.push_back(key);
            WORKQUEUE_DEPTH
                .with_label_values(&[self.name])
                .set(state.ready.len() as i64);
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Add a key after `delay`. The timer is dropped on cancellation.
    pub fn enqueue_after(&self, key: ObjectKey, delay: Duration, cancel: &CancellationToken) {
        let queue = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.enqueue(key),
            }
        });
    }

    /// Wait for the next key, marking it active
    pub async fn next(&self) -> ObjectKey {
        loop {
            {
                let mut state = self.inner.state.lock().expect("workqueue lock poisoned");
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    WORKQUEUE_DEPTH
                        .with_label_values(&[self.name])
                        .set(state.ready.len() as i64);
                    return key;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Mark the key's reconcile finished; re-delivers it immediately if it
    /// arrived again while in flight.
    pub fn done(&self, key: &ObjectKey) {
        let rerun = {
            let mut state = self.inner.state.lock().expect("workqueue lock poisoned");
            state.active.remove(key);
            state.rerun.remove(key)
        };
        if rerun {
            self.enqueue(key.clone());
        }
    }

    /// Reset the key's failure streak
    pub fn succeeded(&self, key: &ObjectKey) {
        let mut state = self.inner.state.lock().expect("workqueue lock poisoned");
        state.failures.remove(key);
    }

    /// Record a failure and return the delay before the next attempt
    pub fn failed(&self, key: &ObjectKey) -> Duration {
        let mut state = self.inner.state.lock().expect("workqueue lock poisoned");
        let count = state.failures.entry(key.clone()).or_insert(0);
        *count += 1;
        let exp = count.saturating_sub(1).min(16);
        BACKOFF_BASE
            .saturating_mul(1u32 << exp)
            .min(BACKOFF_MAX)
    }
}
