//! Configuration loading and representation.
//!
//! Every knob has a default and a `JOBQ_*` environment override. Values are
//! parsed strictly: a malformed or zero value fails startup instead of being
//! silently replaced by the default.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::jobs::WorkerPoolConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Process-wide queue settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub bind_addr: SocketAddr,
    /// SQLite URL; `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub workers: usize,
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    pub rate_limit: u32,
    pub rate_window: Duration,
    pub max_running_per_tenant: usize,
    pub default_max_retries: u32,
    pub snapshot_limit: usize,
    pub list_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            workers: 3,
            poll_interval: Duration::from_secs(2),
            lease_duration: Duration::from_secs(30),
            rate_limit: 10,
            rate_window: Duration::from_secs(60),
            max_running_per_tenant: 5,
            default_max_retries: jobq_core::DEFAULT_MAX_RETRIES,
            snapshot_limit: 500,
            list_limit: 100,
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let get = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty());

        let config = Self {
            bind_addr: parse(&get, "JOBQ_BIND_ADDR")?.unwrap_or(d.bind_addr),
            database_url: get("JOBQ_DATABASE_URL").map(|v| v.trim().to_string()),
            workers: parse(&get, "JOBQ_WORKERS")?.unwrap_or(d.workers),
            poll_interval: parse(&get, "JOBQ_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.poll_interval),
            lease_duration: parse(&get, "JOBQ_LEASE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(d.lease_duration),
            rate_limit: parse(&get, "JOBQ_RATE_LIMIT")?.unwrap_or(d.rate_limit),
            rate_window: parse(&get, "JOBQ_RATE_WINDOW_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(d.rate_window),
            max_running_per_tenant: parse(&get, "JOBQ_MAX_RUNNING")?
                .unwrap_or(d.max_running_per_tenant),
            default_max_retries: parse(&get, "JOBQ_DEFAULT_MAX_RETRIES")?
                .unwrap_or(d.default_max_retries),
            snapshot_limit: parse(&get, "JOBQ_SNAPSHOT_LIMIT")?.unwrap_or(d.snapshot_limit),
            list_limit: parse(&get, "JOBQ_LIST_LIMIT")?.unwrap_or(d.list_limit),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, bool, String); 9] = [
            ("JOBQ_WORKERS", self.workers == 0, self.workers.to_string()),
            (
                "JOBQ_POLL_INTERVAL_MS",
                self.poll_interval.is_zero(),
                self.poll_interval.as_millis().to_string(),
            ),
            (
                "JOBQ_LEASE_SECS",
                self.lease_duration.is_zero(),
                self.lease_duration.as_secs().to_string(),
            ),
            ("JOBQ_RATE_LIMIT", self.rate_limit == 0, self.rate_limit.to_string()),
            (
                "JOBQ_RATE_WINDOW_SECS",
                self.rate_window.is_zero(),
                self.rate_window.as_secs().to_string(),
            ),
            (
                "JOBQ_MAX_RUNNING",
                self.max_running_per_tenant == 0,
                self.max_running_per_tenant.to_string(),
            ),
            (
                "JOBQ_DEFAULT_MAX_RETRIES",
                self.default_max_retries == 0,
                self.default_max_retries.to_string(),
            ),
            (
                "JOBQ_SNAPSHOT_LIMIT",
                self.snapshot_limit == 0,
                self.snapshot_limit.to_string(),
            ),
            ("JOBQ_LIST_LIMIT", self.list_limit == 0, self.list_limit.to_string()),
        ];

        match checks.into_iter().find(|(_, bad, _)| *bad) {
            Some((var, _, value)) => Err(ConfigError::Invalid { var, value }),
            None => Ok(()),
        }
    }

    pub fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_workers(self.workers)
            .with_poll_interval(self.poll_interval)
            .with_lease_duration(self.lease_duration)
    }
}

fn parse<T, G>(get: &G, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    G: Fn(&'static str) -> Option<String>,
{
    match get(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
    }
}
