//! `jobq-core`: queue domain building blocks.
//!
//! This crate contains the **pure domain** of the job queue: identifiers, the
//! `Job` entity, the retry/dead-letter state machine and the metrics
//! aggregate. No storage or transport concerns live here.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod lifecycle;
pub mod metrics;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{IdempotencyKey, JobId, TenantId, TraceId};
pub use job::{DEFAULT_MAX_RETRIES, Job, JobStatus, NewJob};
pub use lifecycle::{DEAD_LETTER_MESSAGE, Outcome, Transition};
pub use metrics::QueueMetrics;
