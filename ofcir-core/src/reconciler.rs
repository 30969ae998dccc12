//! Controllers register to the manager by implementing these traits.
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use ofcir_model::ObjectKey;

/// What the manager should do with the key after a successful reconcile
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ReconcileStatus {
    /// Nothing more to do until the next watch event
    Done,
    /// Re-deliver the key after the given delay
    RequeueAfter(Duration),
}

impl ReconcileStatus {
    /// Shorthand for [`ReconcileStatus::RequeueAfter`]
    pub fn requeue(after: Duration) -> Self {
        ReconcileStatus::RequeueAfter(after)
    }
}

/// A reconcile function `(key, cancel) -> (requeue, error)`.
///
/// At most one reconcile runs per key at a time; different keys run in
/// parallel. Errors are logged by the manager and the key is re-enqueued
/// with backoff.
///
/// CANCEL-SAFETY: `cancel` fires when the process shuts down; long provider
/// calls must select on it and bail out with an error.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, key: ObjectKey, cancel: CancellationToken)
        -> Result<ReconcileStatus>;
}

/// Enumerates the keys a controller is responsible for, used by the
/// periodic resync tick to re-deliver everything.
#[async_trait]
pub trait KeyLister: Send + Sync + 'static {
    async fn keys(&self) -> Result<Vec<ObjectKey>>;
}
