//! # Manager
//!
//! Owns the registered controllers and drives their reconcile loops to
//! completion: watch events and periodic resyncs feed each controller's
//! work queue, a dispatch loop hands keys to the reconciler with bounded
//! concurrency, and a broadcast/mpsc pair drains everything on shutdown.
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use ofcir_model::ObjectKey;

use crate::metrics::{RECONCILE_COUNT, RECONCILE_DURATION};
use crate::queue::WorkQueue;
use crate::reconciler::{KeyLister, ReconcileStatus, Reconciler};

/// How long the drain waits for in-flight reconciles on shutdown
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(3);

/// Default resync period: every key is re-delivered this often even
/// without watch events
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(60);

/// Default cap on concurrently reconciling keys per controller
pub const DEFAULT_MAX_CONCURRENT: usize = 16;

/// One named reconcile loop: a watch source, a key lister for resyncs and
/// the reconciler the keys are handed to.
pub struct Controller {
    name: &'static str,
    reconciler: Arc<dyn Reconciler>,
    watch: broadcast::Receiver<ObjectKey>,
    lister: Arc<dyn KeyLister>,
    resync: Duration,
    max_concurrent: usize,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.name)
            .field("resync", &self.resync)
            .field("max_concurrent", &self.max_concurrent)
            .finish()
    }
}

impl Controller {
    pub fn new<R, L>(
        name: &'static str,
        watch: broadcast::Receiver<ObjectKey>,
        lister: L,
        reconciler: R,
    ) -> Self
    where
        R: Reconciler,
        L: KeyLister,
    {
        Self {
            name,
            reconciler: Arc::new(reconciler),
            watch,
            lister: Arc::new(lister),
            resync: DEFAULT_RESYNC,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }

    /// Override the resync period
    pub fn resync(mut self, period: Duration) -> Self {
        self.resync = period;
        self
    }

    /// Override the per-controller concurrency cap
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }
}

/// Holds the list of controllers and runs them until shutdown
#[derive(Default)]
pub struct Manager {
    controllers: Vec<Controller>,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("controllers", &self.controllers)
            .finish()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a controller to run
    pub fn register(&mut self, controller: Controller) -> &mut Self {
        self.controllers.push(controller);
        self
    }

    /// Run all controllers until the `shutdown` future resolves, then
    /// drain in-flight work.
    pub async fn start<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        let (notify_shutdown, _) = broadcast::channel::<()>(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);
        let cancel = CancellationToken::new();

        for controller in self.controllers {
            spawn_controller(
                controller,
                &notify_shutdown,
                &shutdown_complete_tx,
                &cancel,
            );
        }

        if let Err(err) = shutdown.await {
            error!(?err, "shutdown signal handler returned error");
        }
        info!("notifying controllers of shutdown...");

        // reconcilers in flight see the cancellation, watch/resync/dispatch
        // loops see the dropped broadcast
        cancel.cancel();
        drop(notify_shutdown);
        // Drop final `Sender` so the `Receiver` below can complete
        drop(shutdown_complete_tx);
        // Wait for all controller tasks to finish processing; the only
        // remaining senders are held by the spawned loops and per-key
        // tasks, so `recv()` returns `None` once they are gone.
        if time::timeout(SHUTDOWN_DRAIN, shutdown_complete_rx.recv())
            .await
            .is_err()
        {
            error!(
                "controllers did not finish within {} seconds-- exiting anyway",
                SHUTDOWN_DRAIN.as_secs()
            );
        } else {
            info!("all controllers finished cleanly");
        }
        Ok(())
    }
}

fn spawn_controller(
    controller: Controller,
    notify_shutdown: &broadcast::Sender<()>,
    shutdown_complete_tx: &mpsc::Sender<()>,
    cancel: &CancellationToken,
) {
    let Controller {
        name,
        reconciler,
        watch,
        lister,
        resync,
        max_concurrent,
    } = controller;

    let queue = WorkQueue::new(name);
    info!(controller = name, ?resync, "starting controller");

    // watch events -> queue
    tokio::spawn(forward_watch(
        name,
        watch,
        queue.clone(),
        notify_shutdown.subscribe(),
        shutdown_complete_tx.clone(),
    ));
    // periodic resync -> queue
    tokio::spawn(resync_loop(
        name,
        lister,
        resync,
        queue.clone(),
        notify_shutdown.subscribe(),
        shutdown_complete_tx.clone(),
    ));
    // queue -> reconciler
    tokio::spawn(dispatch_loop(
        name,
        reconciler,
        queue,
        max_concurrent,
        notify_shutdown.subscribe(),
        shutdown_complete_tx.clone(),
        cancel.child_token(),
    ));
}

async fn forward_watch(
    name: &'static str,
    mut watch: broadcast::Receiver<ObjectKey>,
    queue: WorkQueue,
    mut shutdown: broadcast::Receiver<()>,
    _shutdown_complete: mpsc::Sender<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                trace!(controller = name, "watch forwarder received shutdown");
                return;
            }
            event = watch.recv() => match event {
                Ok(key) => queue.enqueue(key),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // resync re-delivers whatever was missed
                    warn!(controller = name, missed, "watch channel lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(controller = name, "watch channel closed");
                    return;
                }
            }
        }
    }
}

async fn resync_loop(
    name: &'static str,
    lister: Arc<dyn KeyLister>,
    period: Duration,
    queue: WorkQueue,
    mut shutdown: broadcast::Receiver<()>,
    _shutdown_complete: mpsc::Sender<()>,
) {
    // first tick fires immediately so existing objects reconcile on startup
    let mut tick = time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                trace!(controller = name, "resync loop received shutdown");
                return;
            }
            _ = tick.tick() => match lister.keys().await {
                Ok(keys) => {
                    trace!(controller = name, count = keys.len(), "resync tick");
                    for key in keys {
                        queue.enqueue(key);
                    }
                }
                Err(err) => warn!(controller = name, ?err, "failed to list keys for resync"),
            }
        }
    }
}

async fn dispatch_loop(
    name: &'static str,
    reconciler: Arc<dyn Reconciler>,
    queue: WorkQueue,
    max_concurrent: usize,
    mut shutdown: broadcast::Receiver<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(max_concurrent));
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                trace!(controller = name, "dispatch loop received shutdown");
                return;
            }
            key = queue.next() => {
                // SAFETY: acquire only errors once the semaphore is
                // closed, which we never do
                let permit = permits.clone().acquire_owned().await.unwrap();
                let task = ReconcileTask {
                    name,
                    key,
                    reconciler: reconciler.clone(),
                    queue: queue.clone(),
                    cancel: cancel.clone(),
                    _shutdown_complete: shutdown_complete_tx.clone(),
                };
                tokio::spawn(async move {
                    task.run().await;
                    drop(permit);
                });
            }
        }
    }
}

/// One reconcile of one key
struct ReconcileTask {
    name: &'static str,
    key: ObjectKey,
    reconciler: Arc<dyn Reconciler>,
    queue: WorkQueue,
    cancel: CancellationToken,
    /// used to determine when all tasks have exited
    _shutdown_complete: mpsc::Sender<()>,
}

impl ReconcileTask {
    async fn run(self) {
        let timer = RECONCILE_DURATION
            .with_label_values(&[self.name])
            .start_timer();
        let result = self
            .reconciler
            .reconcile(self.key.clone(), self.cancel.clone())
            .await;
        timer.observe_duration();

        match result {
            Ok(status) => {
                RECONCILE_COUNT.with_label_values(&[self.name, "ok"]).inc();
                self.queue.succeeded(&self.key);
                self.queue.done(&self.key);
                if let ReconcileStatus::RequeueAfter(delay) = status {
                    trace!(controller = self.name, key = %self.key, ?delay, "requeueing");
                    self.queue.enqueue_after(self.key, delay, &self.cancel);
                }
            }
            Err(err) => {
                RECONCILE_COUNT
                    .with_label_values(&[self.name, "error"])
                    .inc();
                let delay = self.queue.failed(&self.key);
                self.queue.done(&self.key);
                warn!(controller = self.name, key = %self.key, ?err, ?delay, "reconcile failed");
                self.queue.enqueue_after(self.key, delay, &self.cancel);
            }
        }
    }
}
