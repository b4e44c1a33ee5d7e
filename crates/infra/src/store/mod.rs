//! Job Store boundary.
//!
//! The store owns every durable job row. `claim_next` is the one operation
//! raced by concurrent pollers and must be a single atomic conditional update
//! in every implementation; the other mutations are fenced on the caller's
//! lease so a stale worker cannot overwrite a newer holder's outcome.

pub mod in_memory;
pub mod sqlite;

#[cfg(test)]
pub(crate) mod conformance;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use jobq_core::{DomainError, IdempotencyKey, Job, JobId, JobStatus, QueueMetrics, TenantId, Transition};

pub use in_memory::InMemoryJobStore;
pub use sqlite::SqliteJobStore;

/// Equality filters for [`JobStore::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub tenant_id: Option<TenantId>,
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.tenant_id.as_ref().is_none_or(|t| &job.tenant_id == t)
    }
}

/// Job store error.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("idempotency key already in use: {0}")]
    DuplicateIdempotencyKey(IdempotencyKey),
    /// The job is no longer Running under the caller's lease.
    #[error("lease lost for job {0}")]
    LeaseLost(JobId),
    #[error(transparent)]
    Invariant(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a freshly created job.
    async fn insert(&self, job: &Job) -> Result<(), StoreError>;

    async fn get_by_id(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    async fn get_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<Job>, StoreError>;

    /// Newest first.
    async fn list(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Atomically claim the oldest eligible job and lease it until
    /// `now + lease`. `Ok(None)` means nothing is eligible.
    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError>;

    /// Running -> Done, only while `leased_until == lease`.
    async fn mark_done(
        &self,
        id: JobId,
        lease: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Running -> Failed with the given retry count, only while
    /// `leased_until == lease`.
    async fn mark_failed(
        &self,
        id: JobId,
        retry_count: u32,
        error_message: &str,
        lease: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Jobs of `tenant_id` currently in `Running`.
    async fn count_running(&self, tenant_id: &TenantId) -> Result<usize, StoreError>;

    async fn metrics(&self) -> Result<QueueMetrics, StoreError>;

    /// Persist a state-machine transition for a job claimed under `lease`.
    async fn apply_transition(
        &self,
        id: JobId,
        transition: &Transition,
        lease: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        match transition {
            Transition::Complete => self.mark_done(id, lease, now).await,
            Transition::Retry { retry_count, .. } | Transition::DeadLetter { retry_count } => {
                let error = transition.error_message().unwrap_or_default();
                self.mark_failed(id, *retry_count, error, lease, now).await
            }
        }
    }
}

#[async_trait]
impl<T> JobStore for Arc<T>
where
    T: JobStore + ?Sized,
{
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        (**self).insert(job).await
    }

    async fn get_by_id(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get_by_id(id).await
    }

    async fn get_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<Job>, StoreError> {
        (**self).get_by_idempotency_key(key).await
    }

    async fn list(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>, StoreError> {
        (**self).list(filter, limit).await
    }

    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError> {
        (**self).claim_next(now, lease).await
    }

    async fn mark_done(
        &self,
        id: JobId,
        lease: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        (**self).mark_done(id, lease, now).await
    }

    async fn mark_failed(
        &self,
        id: JobId,
        retry_count: u32,
        error_message: &str,
        lease: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        (**self)
            .mark_failed(id, retry_count, error_message, lease, now)
            .await
    }

    async fn count_running(&self, tenant_id: &TenantId) -> Result<usize, StoreError> {
        (**self).count_running(tenant_id).await
    }

    async fn metrics(&self) -> Result<QueueMetrics, StoreError> {
        (**self).metrics().await
    }
}

/// Expiry of a lease taken at `now`.
pub(crate) fn lease_expiry(now: DateTime<Utc>, lease: Duration) -> Result<DateTime<Utc>, StoreError> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| StoreError::Storage(format!("lease duration {lease:?} out of range")))
}
