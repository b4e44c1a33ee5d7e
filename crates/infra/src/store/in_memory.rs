//! In-memory job store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobq_core::{IdempotencyKey, Job, JobId, JobStatus, QueueMetrics, TenantId};

use super::{JobFilter, JobStore, StoreError, lease_expiry};

#[derive(Debug)]
struct Row {
    /// Insertion order; breaks `created_at` ties.
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct Table {
    rows: HashMap<JobId, Row>,
    by_key: HashMap<IdempotencyKey, JobId>,
    next_seq: u64,
}

/// In-memory job store.
///
/// One mutex guards the whole table, so `claim_next` selects and leases its
/// row inside a single critical section.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    table: Mutex<Table>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn table(&self) -> Result<MutexGuard<'_, Table>, StoreError> {
        self.table
            .lock()
            .map_err(|_| StoreError::Storage("job table lock poisoned".to_string()))
    }

    /// Run `f` on a copy of the row held under `lease`, then commit it if the
    /// result still satisfies the job invariants.
    fn update_leased<F>(&self, id: JobId, lease: DateTime<Utc>, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Job),
    {
        let mut table = self.table()?;
        let row = table.rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if row.job.status != JobStatus::Running || row.job.leased_until != Some(lease) {
            return Err(StoreError::LeaseLost(id));
        }

        let mut updated = row.job.clone();
        f(&mut updated);
        updated.check_invariants()?;
        row.job = updated;
        Ok(())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        job.check_invariants()?;

        let mut table = self.table()?;
        if table.rows.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        if let Some(key) = &job.idempotency_key {
            if table.by_key.contains_key(key) {
                return Err(StoreError::DuplicateIdempotencyKey(key.clone()));
            }
            table.by_key.insert(key.clone(), job.id);
        }

        let seq = table.next_seq;
        table.next_seq += 1;
        table.rows.insert(
            job.id,
            Row {
                seq,
                job: job.clone(),
            },
        );
        Ok(())
    }

    async fn get_by_id(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let table = self.table()?;
        Ok(table.rows.get(&id).map(|r| r.job.clone()))
    }

    async fn get_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<Job>, StoreError> {
        let table = self.table()?;
        Ok(table
            .by_key
            .get(key)
            .and_then(|id| table.rows.get(id))
            .map(|r| r.job.clone()))
    }

    async fn list(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>, StoreError> {
        let table = self.table()?;
        let mut rows: Vec<&Row> = table.rows.values().filter(|r| filter.matches(&r.job)).collect();

        rows.sort_by(|a, b| (b.job.created_at, b.seq).cmp(&(a.job.created_at, a.seq)));
        Ok(rows.into_iter().take(limit).map(|r| r.job.clone()).collect())
    }

    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let until = lease_expiry(now, lease)?;
        let mut table = self.table()?;

        // Oldest eligible job first (FIFO).
        let next = table
            .rows
            .values()
            .filter(|r| r.job.is_claimable(now))
            .min_by_key(|r| (r.job.created_at, r.seq))
            .map(|r| r.job.id);

        let Some(id) = next else {
            return Ok(None);
        };

        match table.rows.get_mut(&id) {
            Some(row) => {
                row.job.lease(now, until);
                Ok(Some(row.job.clone()))
            }
            None => Ok(None),
        }
    }

    async fn mark_done(
        &self,
        id: JobId,
        lease: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update_leased(id, lease, |job| {
            job.status = JobStatus::Done;
            job.leased_until = None;
            job.error_message = None;
            job.updated_at = now;
        })
    }

    async fn mark_failed(
        &self,
        id: JobId,
        retry_count: u32,
        error_message: &str,
        lease: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update_leased(id, lease, |job| {
            job.status = JobStatus::Failed;
            job.retry_count = retry_count;
            job.leased_until = None;
            job.error_message = Some(error_message.to_string());
            job.updated_at = now;
        })
    }

    async fn count_running(&self, tenant_id: &TenantId) -> Result<usize, StoreError> {
        let table = self.table()?;
        Ok(table
            .rows
            .values()
            .filter(|r| r.job.status == JobStatus::Running && &r.job.tenant_id == tenant_id)
            .count())
    }

    async fn metrics(&self) -> Result<QueueMetrics, StoreError> {
        let table = self.table()?;
        Ok(QueueMetrics::from_jobs(table.rows.values().map(|r| &r.job)))
    }
}
