//! The job entity and its derived predicates.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{IdempotencyKey, JobId, TenantId, TraceId};

/// Retry ceiling applied when a submission does not specify one (or passes 0).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Stored job status.
///
/// `Failed` is overloaded: it is schedulable while `retry_count < max_retries`
/// and terminal (dead-lettered) once the budget is spent. Dead-lettering is
/// derived, see [`Job::is_dead_lettered`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Done,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!(
                "unknown status '{other}' (expected pending, running, done or failed)"
            ))),
        }
    }
}

/// Submission input, before an id and trace id are assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub tenant_id: TenantId,
    pub payload: String,
    pub idempotency_key: Option<IdempotencyKey>,
    pub max_retries: Option<u32>,
}

impl NewJob {
    pub fn new(tenant_id: TenantId, payload: impl Into<String>) -> Self {
        Self {
            tenant_id,
            payload: payload.into(),
            idempotency_key: None,
            max_retries: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A unit of work owned by a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    /// Opaque blob handed verbatim to the task executor.
    pub payload: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<IdempotencyKey>,
    /// Executed failures so far; never incremented by lease expiry.
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Present iff `status == Running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leased_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub trace_id: TraceId,
}

impl Job {
    /// Create a pending job from a submission.
    ///
    /// Assigns fresh `id`/`trace_id` and defaults `max_retries` when it is
    /// absent or zero.
    pub fn create(new: NewJob, now: DateTime<Utc>) -> DomainResult<Self> {
        if new.payload.is_empty() {
            return Err(DomainError::validation("payload must not be empty"));
        }

        let max_retries = match new.max_retries {
            None | Some(0) => DEFAULT_MAX_RETRIES,
            Some(n) => n,
        };

        Ok(Self {
            id: JobId::new(),
            tenant_id: new.tenant_id,
            payload: new.payload,
            status: JobStatus::Pending,
            idempotency_key: new.idempotency_key,
            retry_count: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            leased_until: None,
            error_message: None,
            trace_id: TraceId::new(),
        })
    }

    /// Terminal failure: the retry budget is exhausted.
    pub fn is_dead_lettered(&self) -> bool {
        self.status == JobStatus::Failed && self.retry_count >= self.max_retries
    }

    /// Failed but still schedulable.
    pub fn is_retryable(&self) -> bool {
        self.status == JobStatus::Failed && self.retry_count < self.max_retries
    }

    /// Whether the job holds an unexpired lease at `now`.
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.leased_until.is_some_and(|until| until > now)
    }

    /// Claim eligibility predicate.
    ///
    /// Pending, Running with an expired lease, or Failed with retry budget
    /// left.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => true,
            JobStatus::Running => self.leased_until.is_some_and(|until| until < now),
            JobStatus::Failed => self.retry_count < self.max_retries,
            JobStatus::Done => false,
        }
    }

    /// Flip to `Running` under a fresh lease. `retry_count` is untouched.
    pub fn lease(&mut self, now: DateTime<Utc>, until: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.leased_until = Some(until);
        self.updated_at = now;
    }

    /// Check the entity-level invariants.
    pub fn check_invariants(&self) -> DomainResult<()> {
        let running = self.status == JobStatus::Running;
        if running != self.leased_until.is_some() {
            return Err(DomainError::invariant(format!(
                "job {} has status {} but leased_until is {}",
                self.id,
                self.status,
                if self.leased_until.is_some() { "set" } else { "absent" }
            )));
        }
        if self.retry_count > self.max_retries {
            return Err(DomainError::invariant(format!(
                "job {} retry_count {} exceeds max_retries {}",
                self.id, self.retry_count, self.max_retries
            )));
        }
        if self.updated_at < self.created_at {
            return Err(DomainError::invariant(format!(
                "job {} updated before it was created",
                self.id
            )));
        }
        Ok(())
    }
}
