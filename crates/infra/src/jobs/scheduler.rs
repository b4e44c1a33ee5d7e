//! Lease Scheduler / Worker Pool.
//!
//! Each poller runs claim → execute → transition once per tick. Pollers share
//! nothing but the job store; the store's atomic claim keeps them apart.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use jobq_core::{Clock, Job, Outcome, Transition};
use jobq_events::{ChangeKind, QueueChange};

use crate::broadcast::ChangeNotifier;
use crate::store::{JobStore, StoreError};

use super::executor::{ExecutorError, TaskExecutor};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of independent pollers
    pub workers: usize,
    /// Tick between claim attempts, per poller
    pub poll_interval: Duration,
    /// Lease granted by each claim
    pub lease_duration: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            poll_interval: Duration::from_secs(2),
            lease_duration: Duration::from_secs(30),
            name: "worker-pool".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub claimed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub lease_lost: u64,
    pub store_errors: u64,
}

/// What one poll cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was eligible.
    Idle,
    Completed,
    Retrying,
    DeadLettered,
    /// The lease expired and was re-claimed before the outcome was recorded;
    /// the outcome was discarded.
    LeaseLost,
    /// A store call failed; the cycle was skipped.
    StoreError,
}

struct PoolInner<S, E: ?Sized> {
    store: S,
    executor: Arc<E>,
    notifier: Arc<dyn ChangeNotifier>,
    clock: Arc<dyn Clock>,
    config: WorkerPoolConfig,
    stats: Arc<Mutex<PoolStats>>,
}

/// Fixed-size pool of pollers over a [`JobStore`].
pub struct WorkerPool<S, E: ?Sized> {
    inner: Arc<PoolInner<S, E>>,
}

impl<S, E: ?Sized> Clone for WorkerPool<S, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, E> WorkerPool<S, E>
where
    S: JobStore + 'static,
    E: TaskExecutor + ?Sized + 'static,
{
    pub fn new(
        store: S,
        executor: Arc<E>,
        notifier: Arc<dyn ChangeNotifier>,
        clock: Arc<dyn Clock>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                store,
                executor,
                notifier,
                clock,
                config,
                stats: Arc::new(Mutex::new(PoolStats::default())),
            }),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats.lock().unwrap().clone()
    }

    fn record(&self, f: impl FnOnce(&mut PoolStats)) {
        f(&mut *self.inner.stats.lock().unwrap());
    }

    fn notify(&self, kind: ChangeKind, job: &Job) {
        let change = QueueChange::for_job(kind, job, self.inner.clock.now());
        self.inner.notifier.notify(change);
    }

    /// Run one claim → execute → transition cycle.
    pub async fn poll_once(&self, worker: usize) -> CycleOutcome {
        let inner = &self.inner;
        let now = inner.clock.now();

        let job = match inner.store.claim_next(now, inner.config.lease_duration).await {
            Ok(Some(job)) => job,
            Ok(None) => return CycleOutcome::Idle,
            Err(e) => {
                error!(pool = %inner.config.name, worker, error = %e, "failed to claim job");
                self.record(|s| s.store_errors += 1);
                return CycleOutcome::StoreError;
            }
        };

        let Some(lease) = job.leased_until else {
            error!(pool = %inner.config.name, worker, job_id = %job.id, "claimed job has no lease");
            self.record(|s| s.store_errors += 1);
            return CycleOutcome::StoreError;
        };

        self.record(|s| s.claimed += 1);
        info!(
            worker,
            job_id = %job.id,
            trace_id = %job.trace_id,
            tenant_id = %job.tenant_id,
            retry_count = job.retry_count,
            "job started"
        );
        self.notify(ChangeKind::Claimed, &job);

        let outcome = self.execute(&job).await;
        let transition = Transition::decide(&job, outcome);
        let now = inner.clock.now();

        match inner.store.apply_transition(job.id, &transition, lease, now).await {
            Ok(()) => {}
            Err(StoreError::LeaseLost(_)) => {
                warn!(
                    worker,
                    job_id = %job.id,
                    trace_id = %job.trace_id,
                    "lease lost before outcome was recorded; outcome discarded"
                );
                self.record(|s| s.lease_lost += 1);
                return CycleOutcome::LeaseLost;
            }
            Err(e) => {
                error!(
                    worker,
                    job_id = %job.id,
                    trace_id = %job.trace_id,
                    error = %e,
                    "failed to persist transition"
                );
                self.record(|s| s.store_errors += 1);
                return CycleOutcome::StoreError;
            }
        }

        match &transition {
            Transition::Complete => {
                info!(worker, job_id = %job.id, trace_id = %job.trace_id, "job finished");
                self.record(|s| s.succeeded += 1);
                self.notify(ChangeKind::Completed, &job);
                CycleOutcome::Completed
            }
            Transition::Retry { retry_count, error } => {
                warn!(
                    worker,
                    job_id = %job.id,
                    trace_id = %job.trace_id,
                    retry_count,
                    max_retries = job.max_retries,
                    error = %error,
                    "job failed; will retry"
                );
                self.record(|s| s.retried += 1);
                self.notify(ChangeKind::Retrying, &job);
                CycleOutcome::Retrying
            }
            Transition::DeadLetter { retry_count } => {
                error!(
                    worker,
                    job_id = %job.id,
                    trace_id = %job.trace_id,
                    retry_count,
                    "job moved to dead-letter queue"
                );
                self.record(|s| s.dead_lettered += 1);
                self.notify(ChangeKind::DeadLettered, &job);
                CycleOutcome::DeadLettered
            }
        }
    }

    /// Invoke the executor on its own task so a panic becomes a failure.
    async fn execute(&self, job: &Job) -> Outcome {
        let executor = Arc::clone(&self.inner.executor);
        let payload = job.payload.clone();

        let joined = tokio::spawn(async move { executor.execute(&payload).await }).await;
        let result = match joined {
            Ok(result) => result,
            Err(e) => Err(ExecutorError::Panicked(e.to_string())),
        };

        match result {
            Ok(true) => Outcome::Succeeded,
            Ok(false) => Outcome::failed("task reported failure"),
            Err(e) => Outcome::failed(e.to_string()),
        }
    }

    /// Start `config.workers` pollers on the current runtime.
    pub fn spawn(&self) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = self.inner.config.workers;

        let joins = (0..workers)
            .map(|worker| {
                let pool = self.clone();
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move { pool.run(worker, shutdown).await })
            })
            .collect();

        info!(pool = %self.inner.config.name, workers, "worker pool started");

        WorkerPoolHandle {
            shutdown: shutdown_tx,
            joins,
            stats: Arc::clone(&self.inner.stats),
        }
    }

    async fn run(self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.inner.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(pool = %self.inner.config.name, worker, "poller started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    self.poll_once(worker).await;
                }
            }
        }
        debug!(pool = %self.inner.config.name, worker, "poller stopped");
    }
}

/// Handle to control running pollers.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<PoolStats>>,
}

impl WorkerPoolHandle {
    /// Signal every poller and wait for them to finish their current cycle.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "poller task failed");
            }
        }
        info!("worker pool stopped");
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.lock().unwrap().clone()
    }
}
