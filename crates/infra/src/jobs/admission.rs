//! Admission control: per-tenant rate gate and concurrency gate.
//!
//! Both gates run before a submission is persisted. Either one rejecting
//! means nothing is enqueued.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use jobq_core::TenantId;

use crate::store::{JobStore, StoreError};

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("rate limit exceeded for tenant {tenant_id}")]
    RateLimited { tenant_id: TenantId },

    #[error("tenant {tenant_id} has {running} running jobs (limit {limit})")]
    QuotaExceeded {
        tenant_id: TenantId,
        running: usize,
        limit: usize,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: DateTime<Utc>,
    remaining: u32,
}

/// Fixed-window token counter keyed by tenant.
///
/// A tenant's window restarts lazily: the first check at or after
/// `started_at + window` refills `limit` tokens and restarts the window at
/// that instant. State is process-local and is lost on restart.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: chrono::Duration,
    windows: Mutex<HashMap<TenantId, Window>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX),
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Take one token for `tenant_id`; `false` when the window is spent.
    pub fn allow(&self, tenant_id: &TenantId, now: DateTime<Utc>) -> bool {
        let mut windows = self.windows.lock().unwrap();

        let window = windows.entry(tenant_id.clone()).or_insert(Window {
            started_at: now,
            remaining: self.limit,
        });

        if now.signed_duration_since(window.started_at) >= self.window {
            window.started_at = now;
            window.remaining = self.limit;
        }

        if window.remaining == 0 {
            return false;
        }
        window.remaining -= 1;
        true
    }

    /// Tokens left in the tenant's current window (ignores a pending reset).
    pub fn remaining(&self, tenant_id: &TenantId) -> u32 {
        let windows = self.windows.lock().unwrap();
        windows
            .get(tenant_id)
            .map(|w| w.remaining)
            .unwrap_or(self.limit)
    }
}

/// Rate gate followed by the concurrency gate.
///
/// The concurrency gate is a point-in-time count of `Running` jobs, not a
/// reservation: simultaneous submissions may briefly exceed `max_running`.
pub struct AdmissionController<S> {
    store: S,
    limiter: RateLimiter,
    max_running: usize,
}

impl<S: JobStore> AdmissionController<S> {
    pub fn new(store: S, limiter: RateLimiter, max_running: usize) -> Self {
        Self {
            store,
            limiter,
            max_running,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn max_running(&self) -> usize {
        self.max_running
    }

    pub async fn admit(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
    ) -> Result<(), AdmissionError> {
        if !self.limiter.allow(tenant_id, now) {
            return Err(AdmissionError::RateLimited {
                tenant_id: tenant_id.clone(),
            });
        }

        let running = self.store.count_running(tenant_id).await?;
        if running >= self.max_running {
            return Err(AdmissionError::QuotaExceeded {
                tenant_id: tenant_id.clone(),
                running,
                limit: self.max_running,
            });
        }

        Ok(())
    }
}
