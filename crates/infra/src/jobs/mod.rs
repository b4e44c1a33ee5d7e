//! Queue engine: admission, submission, execution and the worker pool.
//!
//! ## Components
//!
//! - `AdmissionController`: per-tenant rate gate + running-job quota
//! - `SubmissionGateway`: idempotent enqueue behind admission
//! - `TaskExecutor`: injected capability that runs a payload
//! - `WorkerPool`: pollers that claim, execute and persist transitions

pub mod admission;
pub mod executor;
pub mod gateway;
pub mod scheduler;

pub use admission::{AdmissionController, AdmissionError, RateLimiter};
pub use executor::{ExecutorError, FnExecutor, SimulatedExecutor, TaskExecutor};
pub use gateway::{Submission, SubmissionGateway, SubmitError, SubmitJob};
pub use scheduler::{CycleOutcome, PoolStats, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
