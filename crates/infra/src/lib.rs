//! Infrastructure layer: job stores, the queue engine, change broadcast and
//! configuration.

pub mod broadcast;
pub mod config;
pub mod jobs;
pub mod store;

pub use broadcast::{ChangeNotifier, NoopNotifier, RecordingNotifier, SnapshotBroadcaster};
pub use config::{ConfigError, QueueConfig};
pub use store::{InMemoryJobStore, JobFilter, JobStore, SqliteJobStore, StoreError};
