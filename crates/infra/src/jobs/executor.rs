//! Task Executor capability.
//!
//! The scheduler hands each claimed payload to a [`TaskExecutor`] and only
//! consumes its outcome. An `Err` or a panic counts as a failed execution.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("execution failed: {0}")]
    Failed(String),

    #[error("executor panicked: {0}")]
    Panicked(String),
}

/// Runs one job payload. `Ok(true)` is success, `Ok(false)` a reported
/// failure.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, payload: &str) -> Result<bool, ExecutorError>;
}

#[async_trait]
impl<E> TaskExecutor for Arc<E>
where
    E: TaskExecutor + ?Sized,
{
    async fn execute(&self, payload: &str) -> Result<bool, ExecutorError> {
        (**self).execute(payload).await
    }
}

/// Executor backed by a plain closure.
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(&str) -> Result<bool, ExecutorError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> TaskExecutor for FnExecutor<F>
where
    F: Fn(&str) -> Result<bool, ExecutorError> + Send + Sync,
{
    async fn execute(&self, payload: &str) -> Result<bool, ExecutorError> {
        (self.f)(payload)
    }
}

/// Demo executor: sleeps for `delay`, then fails every `fail_every`-th call.
#[derive(Debug)]
pub struct SimulatedExecutor {
    delay: Duration,
    fail_every: Option<u64>,
    calls: AtomicU64,
}

impl SimulatedExecutor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            fail_every: None,
            calls: AtomicU64::new(0),
        }
    }

    /// `0` disables failures.
    pub fn with_fail_every(mut self, n: u64) -> Self {
        self.fail_every = (n > 0).then_some(n);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(2)).with_fail_every(5)
    }
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(&self, _payload: &str) -> Result<bool, ExecutorError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.fail_every {
            Some(n) if call % n == 0 => Err(ExecutorError::Failed(format!(
                "simulated failure on call {call}"
            ))),
            _ => Ok(true),
        }
    }
}
