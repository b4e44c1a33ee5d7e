//! SQLite-backed job store.
//!
//! Timestamps are stored as microseconds since the Unix epoch so that the
//! claim predicate and FIFO ordering compare integers. `seq` is an
//! autoincrement column that breaks `created_at` ties in insertion order.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError | Scenario |
//! |------------|------------|----------|
//! | Database (unique, `jobs.idempotency_key`, other id) | `DuplicateIdempotencyKey` | Racing submissions with one key |
//! | Database (unique, `jobs.id` or same row reinserted) | `AlreadyExists` | Job id reused |
//! | Database (check violation) | `Invariant` | Update would break a row invariant |
//! | Anything else | `Storage` | Pool closed, I/O, decode failures |

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::error::ErrorKind;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{FromRow, Row, SqlitePool};
use tracing::{debug, instrument};
use uuid::Uuid;

use jobq_core::{
    DomainError, IdempotencyKey, Job, JobId, JobStatus, QueueMetrics, TenantId, TraceId,
};

use super::{JobFilter, JobStore, StoreError, lease_expiry};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        seq             INTEGER PRIMARY KEY AUTOINCREMENT,
        id              TEXT    NOT NULL UNIQUE,
        tenant_id       TEXT    NOT NULL,
        payload         TEXT    NOT NULL,
        status          TEXT    NOT NULL
                        CHECK (status IN ('pending', 'running', 'done', 'failed')),
        idempotency_key TEXT    UNIQUE,
        retry_count     INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
        max_retries     INTEGER NOT NULL CHECK (max_retries > 0),
        created_at      INTEGER NOT NULL,
        updated_at      INTEGER NOT NULL,
        leased_until    INTEGER,
        error_message   TEXT,
        trace_id        TEXT    NOT NULL,
        CHECK (retry_count <= max_retries),
        CHECK ((status = 'running') = (leased_until IS NOT NULL))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (status, created_at, seq)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_tenant_status ON jobs (tenant_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs (created_at)",
];

const COLUMNS: &str = "id, tenant_id, payload, status, idempotency_key, retry_count, \
     max_retries, created_at, updated_at, leased_until, error_message, trace_id";

/// SQLite-backed [`JobStore`].
///
/// `claim_next` is a single `UPDATE ... RETURNING` whose target row is chosen
/// by a subquery over the eligibility predicate. SQLite serializes writers,
/// so two pollers can never lease the same row.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Wrap an existing pool. Call [`SqliteJobStore::migrate`] before use.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `url` and apply the schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| map_sqlx_error("connect", e))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database.
    ///
    /// Every connection to `sqlite::memory:` sees its own database, so the
    /// pool is pinned to one connection that is never recycled.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| map_sqlx_error("connect", e))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        debug!("job schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Shared tail of `mark_done`/`mark_failed`: zero rows touched means the
    /// row is gone or the caller's lease is stale.
    async fn resolve_fenced_miss(&self, id: JobId) -> Result<(), StoreError> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("fence_check", e))?;

        match exists {
            Some(_) => Err(StoreError::LeaseLost(id)),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn fetch_one_by(&self, column: &str, value: String) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM jobs WHERE {column} = ?1");
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode_job(&r)).transpose()
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, tenant_id = %job.tenant_id), err)]
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        job.check_invariants()?;

        let sql = format!(
            "INSERT INTO jobs ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        );
        let result = sqlx::query(&sql)
            .bind(job.id.to_string())
            .bind(job.tenant_id.as_str())
            .bind(&job.payload)
            .bind(job.status.as_str())
            .bind(job.idempotency_key.as_ref().map(|k| k.as_str()))
            .bind(i64::from(job.retry_count))
            .bind(i64::from(job.max_retries))
            .bind(job.created_at.timestamp_micros())
            .bind(job.updated_at.timestamp_micros())
            .bind(job.leased_until.map(|t| t.timestamp_micros()))
            .bind(job.error_message.as_deref())
            .bind(job.trace_id.to_string())
            .execute(&self.pool)
            .await;

        let err = match result {
            Ok(_) => return Ok(()),
            Err(err) => err,
        };

        match (unique_violation_target(&err), &job.idempotency_key) {
            (Some(UniqueTarget::Id), _) => Err(StoreError::AlreadyExists(job.id)),
            // SQLite names only the first violated index, so a reinserted row
            // that repeats both id and key is reported against the key.
            (Some(UniqueTarget::IdempotencyKey), Some(key)) => {
                match self.get_by_idempotency_key(key).await? {
                    Some(existing) if existing.id == job.id => {
                        Err(StoreError::AlreadyExists(job.id))
                    }
                    _ => Err(StoreError::DuplicateIdempotencyKey(key.clone())),
                }
            }
            _ => Err(map_sqlx_error("insert", err)),
        }
    }

    async fn get_by_id(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.fetch_one_by("id", id.to_string()).await
    }

    async fn get_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<Job>, StoreError> {
        self.fetch_one_by("idempotency_key", key.as_str().to_string())
            .await
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR tenant_id = ?2) \
             ORDER BY created_at DESC, seq DESC LIMIT ?3"
        );
        let rows = sqlx::query(&sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.tenant_id.as_ref().map(|t| t.as_str()))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let until = lease_expiry(now, lease)?;

        let sql = format!(
            r#"
            UPDATE jobs
               SET status = 'running', leased_until = ?2, updated_at = ?1
             WHERE seq = (
                    SELECT seq FROM jobs
                     WHERE status = 'pending'
                        OR (status = 'running' AND leased_until < ?1)
                        OR (status = 'failed' AND retry_count < max_retries)
                     ORDER BY created_at ASC, seq ASC
                     LIMIT 1)
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(now.timestamp_micros())
            .bind(until.timestamp_micros())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.map(|r| decode_job(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn mark_done(
        &self,
        id: JobId,
        lease: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
               SET status = 'done', leased_until = NULL, error_message = NULL, updated_at = ?3
             WHERE id = ?1 AND status = 'running' AND leased_until = ?2
            "#,
        )
        .bind(id.to_string())
        .bind(lease.timestamp_micros())
        .bind(now.timestamp_micros())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_done", e))?;

        if result.rows_affected() == 0 {
            return self.resolve_fenced_miss(id).await;
        }
        Ok(())
    }

    #[instrument(skip(self, error_message), err)]
    async fn mark_failed(
        &self,
        id: JobId,
        retry_count: u32,
        error_message: &str,
        lease: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
               SET status = 'failed', retry_count = ?4, error_message = ?5,
                   leased_until = NULL, updated_at = ?3
             WHERE id = ?1 AND status = 'running' AND leased_until = ?2
            "#,
        )
        .bind(id.to_string())
        .bind(lease.timestamp_micros())
        .bind(now.timestamp_micros())
        .bind(i64::from(retry_count))
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        if result.rows_affected() == 0 {
            return self.resolve_fenced_miss(id).await;
        }
        Ok(())
    }

    async fn count_running(&self, tenant_id: &TenantId) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE tenant_id = ?1 AND status = 'running'",
        )
        .bind(tenant_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_running", e))?;

        Ok(usize::try_from(count).unwrap_or(0))
    }

    #[instrument(skip(self), err)]
    async fn metrics(&self) -> Result<QueueMetrics, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*)                                                              AS total_jobs,
                COALESCE(SUM(status = 'pending'), 0)                                  AS pending_jobs,
                COALESCE(SUM(status = 'running'), 0)                                  AS running_jobs,
                COALESCE(SUM(status = 'done'), 0)                                     AS completed_jobs,
                COALESCE(SUM(status = 'failed' AND retry_count < max_retries), 0)     AS failed_jobs,
                COALESCE(SUM(status = 'failed' AND retry_count >= max_retries), 0)    AS dlq_jobs,
                COALESCE(SUM(retry_count), 0)                                         AS total_retries
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("metrics", e))?;

        let count = |name: &str| -> Result<u64, StoreError> {
            let v: i64 = row.try_get(name).map_err(|e| map_sqlx_error("metrics", e))?;
            Ok(u64::try_from(v).unwrap_or(0))
        };

        Ok(QueueMetrics {
            total_jobs: count("total_jobs")?,
            pending_jobs: count("pending_jobs")?,
            running_jobs: count("running_jobs")?,
            completed_jobs: count("completed_jobs")?,
            failed_jobs: count("failed_jobs")?,
            dlq_jobs: count("dlq_jobs")?,
            total_retries: count("total_retries")?,
        })
    }
}

/// Raw `jobs` row before domain validation.
struct JobRow {
    id: String,
    tenant_id: String,
    payload: String,
    status: String,
    idempotency_key: Option<String>,
    retry_count: i64,
    max_retries: i64,
    created_at: i64,
    updated_at: i64,
    leased_until: Option<i64>,
    error_message: Option<String>,
    trace_id: String,
}

impl<'r> FromRow<'r, SqliteRow> for JobRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            idempotency_key: row.try_get("idempotency_key")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            leased_until: row.try_get("leased_until")?,
            error_message: row.try_get("error_message")?,
            trace_id: row.try_get("trace_id")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let uuid = |s: &str| {
            Uuid::parse_str(s).map_err(|e| DomainError::invalid_id(format!("{s}: {e}")))
        };
        let micros = |v: i64| {
            DateTime::from_timestamp_micros(v)
                .ok_or_else(|| StoreError::Storage(format!("timestamp out of range: {v}")))
        };
        let count = |v: i64| {
            u32::try_from(v).map_err(|_| StoreError::Storage(format!("count out of range: {v}")))
        };

        Ok(Job {
            id: JobId::from_uuid(uuid(&row.id)?),
            tenant_id: TenantId::new(row.tenant_id)?,
            payload: row.payload,
            status: JobStatus::from_str(&row.status)?,
            idempotency_key: row.idempotency_key.map(IdempotencyKey::new).transpose()?,
            retry_count: count(row.retry_count)?,
            max_retries: count(row.max_retries)?,
            created_at: micros(row.created_at)?,
            updated_at: micros(row.updated_at)?,
            leased_until: row.leased_until.map(micros).transpose()?,
            error_message: row.error_message,
            trace_id: TraceId::from_uuid(uuid(&row.trace_id)?),
        })
    }
}

fn decode_job(row: &SqliteRow) -> Result<Job, StoreError> {
    let raw = JobRow::from_row(row).map_err(|e| map_sqlx_error("decode", e))?;
    Job::try_from(raw)
}

enum UniqueTarget {
    Id,
    IdempotencyKey,
}

fn unique_violation_target(err: &sqlx::Error) -> Option<UniqueTarget> {
    let sqlx::Error::Database(db_err) = err else {
        return None;
    };
    if !matches!(db_err.kind(), ErrorKind::UniqueViolation) {
        return None;
    }
    // "UNIQUE constraint failed: jobs.id"
    let columns = db_err
        .message()
        .rsplit(": ")
        .next()
        .unwrap_or_default();
    let mut columns = columns.split(',').map(str::trim);
    if columns.clone().any(|c| c == "jobs.id") {
        Some(UniqueTarget::Id)
    } else if columns.any(|c| c == "jobs.idempotency_key") {
        Some(UniqueTarget::IdempotencyKey)
    } else {
        Some(UniqueTarget::Id)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.kind() {
                ErrorKind::CheckViolation => StoreError::Invariant(DomainError::invariant(msg)),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        other => StoreError::Storage(format!("{} failed: {}", operation, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;
    use std::sync::Arc;

    async fn store() -> SqliteJobStore {
        SqliteJobStore::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn insert_and_lookup() {
        conformance::insert_and_lookup(&store().await).await;
    }

    #[tokio::test]
    async fn idempotency_key_is_unique() {
        conformance::idempotency_key_is_unique(&store().await).await;
    }

    #[tokio::test]
    async fn reused_id_is_reported_as_existing() {
        conformance::reused_id_is_reported_as_existing(&store().await).await;
    }

    #[tokio::test]
    async fn claim_is_fifo_and_exclusive() {
        conformance::claim_is_fifo_and_exclusive(&store().await).await;
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_without_retry_increment() {
        conformance::expired_lease_is_reclaimed(&store().await).await;
    }

    #[tokio::test]
    async fn failed_jobs_are_reclaimed_until_dead_lettered() {
        conformance::failed_jobs_until_dead_lettered(&store().await).await;
    }

    #[tokio::test]
    async fn stale_lease_cannot_overwrite_outcome() {
        conformance::stale_lease_is_fenced(&store().await).await;
    }

    #[tokio::test]
    async fn list_filters_and_orders_newest_first() {
        conformance::list_filters_and_orders(&store().await).await;
    }

    #[tokio::test]
    async fn running_count_and_metrics() {
        conformance::running_count_and_metrics(&store().await).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_never_share_a_job() {
        conformance::concurrent_claims_are_exclusive(Arc::new(store().await)).await;
    }

    async fn file_store(dir: &tempfile::TempDir) -> SqliteJobStore {
        let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
        SqliteJobStore::connect(&url).await.unwrap()
    }

    #[tokio::test]
    async fn connect_opens_wal_database_that_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let job = conformance::job("t1", "p", conformance::now());
        {
            let store = file_store(&dir).await;
            let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
                .fetch_one(store.pool())
                .await
                .unwrap();
            assert_eq!(mode.to_lowercase(), "wal");
            store.insert(&job).await.unwrap();
            store.pool().close().await;
        }

        let reopened = file_store(&dir).await;
        let stored = reopened.get_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.payload, "p");
        assert_eq!(stored.created_at, job.created_at);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn file_backed_claims_never_share_a_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir).await;
        assert!(store.pool().options().get_max_connections() > 1);
        conformance::concurrent_claims_are_exclusive(Arc::new(store)).await;
    }

    #[tokio::test]
    async fn check_constraint_surfaces_as_invariant() {
        let store = store().await;
        let now = conformance::now();
        let job = conformance::job("t1", "p", now);
        store.insert(&job).await.unwrap();

        let claimed = store
            .claim_next(now, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let err = store
            .mark_failed(job.id, job.max_retries + 1, "boom", claimed.leased_until.unwrap(), now)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invariant(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let store = store().await;
        store.migrate().await.unwrap();
        store.insert(&conformance::job("t1", "p", conformance::now())).await.unwrap();
        assert_eq!(store.metrics().await.unwrap().total_jobs, 1);
    }
}
