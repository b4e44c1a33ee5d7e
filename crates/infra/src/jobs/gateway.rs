//! Submission Gateway: idempotent enqueue behind admission control.

use std::sync::Arc;

use chrono::SubsecRound;
use thiserror::Error;
use tracing::{info, warn};

use jobq_core::{Clock, DomainError, IdempotencyKey, Job, NewJob, TenantId};
use jobq_events::{ChangeKind, QueueChange};

use crate::broadcast::ChangeNotifier;
use crate::store::{JobStore, StoreError};

use super::admission::{AdmissionController, AdmissionError};

/// Raw submission as it arrives from a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitJob {
    pub tenant_id: String,
    pub payload: String,
    pub idempotency_key: Option<String>,
    pub max_retries: Option<u32>,
}

impl SubmitJob {
    pub fn new(tenant_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// A new job was enqueued.
    Created(Job),
    /// The idempotency key matched an existing job; nothing was enqueued.
    Existing(Job),
}

impl Submission {
    pub fn job(&self) -> &Job {
        match self {
            Submission::Created(job) | Submission::Existing(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            Submission::Created(job) | Submission::Existing(job) => job,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Submission::Created(_))
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid submission: {0}")]
    Validation(#[from] DomainError),

    #[error("rate limit exceeded for tenant {tenant_id}")]
    RateLimited { tenant_id: TenantId },

    #[error("tenant {tenant_id} has {running} running jobs (limit {limit})")]
    QuotaExceeded {
        tenant_id: TenantId,
        running: usize,
        limit: usize,
    },

    #[error(transparent)]
    Store(StoreError),
}

impl From<AdmissionError> for SubmitError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::RateLimited { tenant_id } => SubmitError::RateLimited { tenant_id },
            AdmissionError::QuotaExceeded {
                tenant_id,
                running,
                limit,
            } => SubmitError::QuotaExceeded {
                tenant_id,
                running,
                limit,
            },
            AdmissionError::Store(e) => SubmitError::Store(e),
        }
    }
}

impl From<StoreError> for SubmitError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Invariant(e) => SubmitError::Validation(e),
            other => SubmitError::Store(other),
        }
    }
}

/// Composes admission control and the job store into `submit`.
pub struct SubmissionGateway<S> {
    store: S,
    admission: AdmissionController<S>,
    notifier: Arc<dyn ChangeNotifier>,
    clock: Arc<dyn Clock>,
    default_max_retries: u32,
}

impl<S: JobStore> SubmissionGateway<S> {
    pub fn new(
        store: S,
        admission: AdmissionController<S>,
        notifier: Arc<dyn ChangeNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            admission,
            notifier,
            clock,
            default_max_retries: jobq_core::DEFAULT_MAX_RETRIES,
        }
    }

    /// Retry budget applied when a submission omits `max_retries` or sends 0.
    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        if max_retries > 0 {
            self.default_max_retries = max_retries;
        }
        self
    }

    pub fn admission(&self) -> &AdmissionController<S> {
        &self.admission
    }

    /// Enqueue a job.
    ///
    /// A known idempotency key short-circuits to the existing job before any
    /// admission check. Otherwise both admission gates must pass; a rejection
    /// persists nothing.
    pub async fn submit(&self, request: SubmitJob) -> Result<Submission, SubmitError> {
        let tenant_id = TenantId::new(request.tenant_id)?;
        if request.payload.is_empty() {
            return Err(DomainError::validation("payload must not be empty").into());
        }

        // A blank key means no dedup was requested.
        let key = match request.idempotency_key {
            Some(k) if !k.trim().is_empty() => Some(IdempotencyKey::new(k)?),
            _ => None,
        };

        if let Some(key) = &key {
            if let Some(existing) = self.store.get_by_idempotency_key(key).await? {
                info!(
                    job_id = %existing.id,
                    tenant_id = %existing.tenant_id,
                    idempotency_key = %key,
                    "idempotent replay; returning existing job"
                );
                return Ok(Submission::Existing(existing));
            }
        }

        // Stores persist microseconds; keep the returned job identical to a later fetch.
        let now = self.clock.now().trunc_subsecs(6);
        if let Err(e) = self.admission.admit(&tenant_id, now).await {
            warn!(tenant_id = %tenant_id, error = %e, "submission rejected");
            return Err(e.into());
        }

        let max_retries = match request.max_retries {
            None | Some(0) => self.default_max_retries,
            Some(n) => n,
        };
        let mut new_job = NewJob::new(tenant_id, request.payload).with_max_retries(max_retries);
        if let Some(key) = key.clone() {
            new_job = new_job.with_idempotency_key(key);
        }
        let job = Job::create(new_job, now)?;

        match self.store.insert(&job).await {
            Ok(()) => {}
            // Lost a race with a concurrent submission carrying the same key.
            Err(StoreError::DuplicateIdempotencyKey(key)) => {
                return match self.store.get_by_idempotency_key(&key).await? {
                    Some(existing) => {
                        info!(
                            job_id = %existing.id,
                            idempotency_key = %key,
                            "idempotent replay after concurrent insert"
                        );
                        Ok(Submission::Existing(existing))
                    }
                    None => Err(SubmitError::Store(StoreError::DuplicateIdempotencyKey(key))),
                };
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            job_id = %job.id,
            trace_id = %job.trace_id,
            tenant_id = %job.tenant_id,
            max_retries = job.max_retries,
            "job submitted"
        );
        self.notifier
            .notify(QueueChange::for_job(ChangeKind::Submitted, &job, now));

        Ok(Submission::Created(job))
    }

    pub async fn get(&self, id: jobq_core::JobId) -> Result<Option<Job>, StoreError> {
        self.store.get_by_id(id).await
    }
}
