//! Change Broadcast: turns queue changes into snapshots on an `EventBus`.
//!
//! Snapshots are published in notification order. Delivery is fire-and-forget. A failed snapshot load or publish is logged
//! and dropped; observers can always fall back to [`SnapshotBroadcaster::snapshot`].

use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use jobq_events::{EventBus, QueueChange, QueueSnapshot};

use crate::store::{JobFilter, JobStore, StoreError};

/// Sink for queue changes.
pub trait ChangeNotifier: Send + Sync {
    fn notify(&self, change: QueueChange);
}

/// Discards every change.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl ChangeNotifier for NoopNotifier {
    fn notify(&self, _change: QueueChange) {}
}

/// Keeps every change in memory, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    changes: Mutex<Vec<QueueChange>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn changes(&self) -> Vec<QueueChange> {
        self.changes.lock().unwrap().clone()
    }
}

impl ChangeNotifier for RecordingNotifier {
    fn notify(&self, change: QueueChange) {
        self.changes.lock().unwrap().push(change);
    }
}

/// Publishes a full [`QueueSnapshot`] after every change.
///
/// Changes are queued to a single task on the current tokio runtime, which
/// loads the newest `snapshot_limit` jobs plus metrics and publishes them in
/// notification order. The task is started by the first notification.
#[derive(Clone)]
pub struct SnapshotBroadcaster<S, B> {
    publisher: Publisher<S, B>,
    queue: Arc<Mutex<Option<mpsc::UnboundedSender<QueueChange>>>>,
}

#[derive(Clone)]
struct Publisher<S, B> {
    store: S,
    bus: B,
    snapshot_limit: usize,
}

impl<S, B> SnapshotBroadcaster<S, B>
where
    S: JobStore + Clone + 'static,
    B: EventBus<QueueSnapshot> + Clone + 'static,
{
    pub fn new(store: S, bus: B, snapshot_limit: usize) -> Self {
        Self {
            publisher: Publisher {
                store,
                bus,
                snapshot_limit,
            },
            queue: Arc::new(Mutex::new(None)),
        }
    }

    pub fn bus(&self) -> &B {
        &self.publisher.bus
    }

    /// Current job list and metrics, tagged with `change` when given.
    pub async fn snapshot(&self, change: Option<QueueChange>) -> Result<QueueSnapshot, StoreError> {
        self.publisher.snapshot(change).await
    }

    fn start_publisher(&self, handle: &Handle) -> mpsc::UnboundedSender<QueueChange> {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueueChange>();
        let publisher = self.publisher.clone();
        handle.spawn(async move {
            while let Some(change) = rx.recv().await {
                publisher.publish(change).await;
            }
        });
        tx
    }
}

impl<S, B> Publisher<S, B>
where
    S: JobStore,
    B: EventBus<QueueSnapshot>,
{
    async fn snapshot(&self, change: Option<QueueChange>) -> Result<QueueSnapshot, StoreError> {
        let jobs = self
            .store
            .list(&JobFilter::default(), self.snapshot_limit)
            .await?;
        let metrics = self.store.metrics().await?;
        Ok(QueueSnapshot {
            change,
            jobs,
            metrics,
        })
    }

    async fn publish(&self, change: QueueChange) {
        let job_id = change.job_id;
        let kind = change.kind.as_str();

        match self.snapshot(Some(change)).await {
            Ok(snapshot) => {
                if let Err(e) = self.bus.publish(snapshot) {
                    warn!(job_id = %job_id, change = kind, error = ?e, "failed to publish snapshot");
                }
            }
            Err(e) => {
                warn!(job_id = %job_id, change = kind, error = %e, "failed to load snapshot");
            }
        }
    }
}

impl<S, B> ChangeNotifier for SnapshotBroadcaster<S, B>
where
    S: JobStore + Clone + 'static,
    B: EventBus<QueueSnapshot> + Clone + 'static,
{
    fn notify(&self, change: QueueChange) {
        let mut queue = self.queue.lock().unwrap();

        // A closed queue means the runtime that owned the publisher is gone.
        let change = match queue.as_ref() {
            Some(tx) => match tx.send(change) {
                Ok(()) => return,
                Err(mpsc::error::SendError(change)) => change,
            },
            None => change,
        };

        let Ok(handle) = Handle::try_current() else {
            *queue = None;
            debug!(job_id = %change.job_id, "no runtime; change not broadcast");
            return;
        };

        let tx = self.start_publisher(&handle);
        if tx.send(change).is_ok() {
            *queue = Some(tx);
        }
    }
}
