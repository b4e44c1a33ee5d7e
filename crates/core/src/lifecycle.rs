//! Retry / dead-letter state machine.
//!
//! ```text
//! Pending --claim--> Running
//! Running --lease expires--> re-claimable in place (retry_count unchanged)
//! Running --success--> Done
//! Running --failure--> Failed (retry_count + 1)
//!                        ├─ retry_count <  max_retries: schedulable again
//!                        └─ retry_count >= max_retries: dead-lettered
//! ```
//!
//! `decide` is pure; stores persist the resulting [`Transition`] as a single
//! atomic update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobStatus};

/// Error message recorded when the retry budget is exhausted.
pub const DEAD_LETTER_MESSAGE: &str = "max retries exceeded";

/// Result of executing a claimed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum Outcome {
    Succeeded,
    Failed { error: String },
}

impl Outcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }
}

/// Status change to persist after an execution outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "transition")]
pub enum Transition {
    /// Running -> Done.
    Complete,
    /// Running -> Failed, still schedulable.
    Retry { retry_count: u32, error: String },
    /// Running -> Failed, terminal.
    DeadLetter { retry_count: u32 },
}

impl Transition {
    /// Decide the transition for `job` given an execution `outcome`.
    pub fn decide(job: &Job, outcome: Outcome) -> Self {
        match outcome {
            Outcome::Succeeded => Transition::Complete,
            Outcome::Failed { error } => {
                let retry_count = job.retry_count.saturating_add(1).min(job.max_retries);
                if retry_count >= job.max_retries {
                    Transition::DeadLetter { retry_count }
                } else {
                    Transition::Retry { retry_count, error }
                }
            }
        }
    }

    /// Status the job ends up in.
    pub fn status(&self) -> JobStatus {
        match self {
            Transition::Complete => JobStatus::Done,
            Transition::Retry { .. } | Transition::DeadLetter { .. } => JobStatus::Failed,
        }
    }

    /// `error_message` to persist (cleared on success).
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Transition::Complete => None,
            Transition::Retry { error, .. } => Some(error),
            Transition::DeadLetter { .. } => Some(DEAD_LETTER_MESSAGE),
        }
    }

    /// New `retry_count`, or `None` when unchanged.
    pub fn retry_count(&self) -> Option<u32> {
        match self {
            Transition::Complete => None,
            Transition::Retry { retry_count, .. } | Transition::DeadLetter { retry_count } => {
                Some(*retry_count)
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Transition::Complete | Transition::DeadLetter { .. })
    }

    /// Apply to an in-memory job. Always releases the lease.
    pub fn apply(&self, job: &mut Job, now: DateTime<Utc>) {
        job.status = self.status();
        if let Some(count) = self.retry_count() {
            job.retry_count = count;
        }
        job.error_message = self.error_message().map(str::to_string);
        job.leased_until = None;
        job.updated_at = now;
    }
}
