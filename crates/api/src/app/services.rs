//! Service wiring: store, admission, gateway, worker pool and the realtime
//! snapshot channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};

use jobq_core::{Clock, SystemClock};
use jobq_events::{EventBus, InMemoryEventBus, QueueSnapshot};
use jobq_infra::jobs::{
    AdmissionController, RateLimiter, SimulatedExecutor, SubmissionGateway, TaskExecutor,
    WorkerPool, WorkerPoolHandle,
};
use jobq_infra::{InMemoryJobStore, JobStore, QueueConfig, SnapshotBroadcaster, SqliteJobStore, StoreError};

pub type DynStore = Arc<dyn JobStore>;
pub type SnapshotBus = Arc<InMemoryEventBus<QueueSnapshot>>;

/// Everything the HTTP handlers and the worker pool share.
pub struct AppServices {
    pub config: QueueConfig,
    pub store: DynStore,
    pub gateway: SubmissionGateway<DynStore>,
    pub broadcaster: SnapshotBroadcaster<DynStore, SnapshotBus>,
    pub pool: WorkerPool<DynStore, dyn TaskExecutor>,
    realtime_tx: broadcast::Sender<QueueSnapshot>,
}

impl AppServices {
    /// Wire services over `store`. Must run inside a tokio runtime.
    pub fn new(config: QueueConfig, store: DynStore, executor: Arc<dyn TaskExecutor>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let bus: SnapshotBus = Arc::new(InMemoryEventBus::new());
        let broadcaster =
            SnapshotBroadcaster::new(Arc::clone(&store), Arc::clone(&bus), config.snapshot_limit);
        let notifier = Arc::new(broadcaster.clone());

        let admission = AdmissionController::new(
            Arc::clone(&store),
            RateLimiter::new(config.rate_limit, config.rate_window),
            config.max_running_per_tenant,
        );
        let gateway = SubmissionGateway::new(
            Arc::clone(&store),
            admission,
            notifier.clone(),
            Arc::clone(&clock),
        )
        .with_default_max_retries(config.default_max_retries);

        let pool = WorkerPool::new(
            Arc::clone(&store),
            executor,
            notifier,
            clock,
            config.worker_pool(),
        );

        let realtime_tx = spawn_realtime_bridge(&bus);

        Self {
            config,
            store,
            gateway,
            broadcaster,
            pool,
            realtime_tx,
        }
    }

    pub fn realtime_tx(&self) -> &broadcast::Sender<QueueSnapshot> {
        &self.realtime_tx
    }

    /// Start the configured number of pollers.
    pub fn start_workers(&self) -> WorkerPoolHandle {
        self.pool.spawn()
    }
}

/// Build services from configuration, with the demo executor.
pub async fn build_services(config: QueueConfig) -> Result<AppServices, StoreError> {
    let executor: Arc<dyn TaskExecutor> = Arc::new(SimulatedExecutor::default());
    build_services_with(config, executor).await
}

/// Build services from configuration with a caller-supplied executor.
pub async fn build_services_with(
    config: QueueConfig,
    executor: Arc<dyn TaskExecutor>,
) -> Result<AppServices, StoreError> {
    let store: DynStore = match &config.database_url {
        Some(url) => {
            info!(database_url = %url, "using sqlite job store");
            Arc::new(SqliteJobStore::connect(url).await?)
        }
        None => {
            info!("using in-memory job store");
            Arc::new(InMemoryJobStore::new())
        }
    };

    Ok(AppServices::new(config, store, executor))
}

/// Forward every published snapshot from the bus into a tokio broadcast
/// channel that SSE handlers subscribe to.
fn spawn_realtime_bridge(bus: &SnapshotBus) -> broadcast::Sender<QueueSnapshot> {
    let (realtime_tx, _realtime_rx) = broadcast::channel::<QueueSnapshot>(256);
    let subscription = bus.subscribe();
    let tx = realtime_tx.clone();

    tokio::task::spawn_blocking(move || {
        loop {
            match subscription.recv_timeout(Duration::from_secs(1)) {
                // No receivers is fine; SSE clients come and go.
                Ok(snapshot) => {
                    let _ = tx.send(snapshot);
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    warn!("snapshot bus closed; realtime bridge stopped");
                    break;
                }
            }
        }
    });

    realtime_tx
}
