//! Behaviour every `JobStore` implementation must share.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};

use jobq_core::{IdempotencyKey, Job, JobStatus, NewJob, Outcome, TenantId, Transition};

use super::{JobFilter, JobStore, StoreError};

const LEASE: Duration = Duration::from_secs(30);

pub(crate) fn job(tenant: &str, payload: &str, at: DateTime<Utc>) -> Job {
    Job::create(NewJob::new(TenantId::new(tenant).unwrap(), payload), at).unwrap()
}

fn keyed_job(tenant: &str, key: &str, at: DateTime<Utc>) -> Job {
    Job::create(
        NewJob::new(TenantId::new(tenant).unwrap(), "p")
            .with_idempotency_key(IdempotencyKey::new(key).unwrap()),
        at,
    )
    .unwrap()
}

/// Wall clock truncated to the microsecond precision stores persist.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

pub(crate) async fn insert_and_lookup<S: JobStore>(store: &S) {
    let now = now();
    let job = keyed_job("t1", "k1", now);
    store.insert(&job).await.unwrap();

    let by_id = store.get_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(by_id.id, job.id);
    assert_eq!(by_id.status, JobStatus::Pending);
    assert_eq!(by_id.payload, "p");
    assert_eq!(by_id.trace_id, job.trace_id);

    let key = IdempotencyKey::new("k1").unwrap();
    let by_key = store.get_by_idempotency_key(&key).await.unwrap().unwrap();
    assert_eq!(by_key.id, job.id);

    let missing = IdempotencyKey::new("nope").unwrap();
    assert!(store.get_by_idempotency_key(&missing).await.unwrap().is_none());
    assert!(store.get_by_id(jobq_core::JobId::new()).await.unwrap().is_none());

    let err = store.insert(&job).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists(id) if id == job.id));
}

pub(crate) async fn idempotency_key_is_unique<S: JobStore>(store: &S) {
    let now = now();
    let first = keyed_job("t1", "same", now);
    let second = keyed_job("t2", "same", now);
    store.insert(&first).await.unwrap();

    let err = store.insert(&second).await.unwrap_err();
    assert!(matches!(err, StoreError::DuplicateIdempotencyKey(ref k) if k.as_str() == "same"));

    // Jobs without keys never collide.
    store.insert(&job("t1", "a", now)).await.unwrap();
    store.insert(&job("t1", "b", now)).await.unwrap();

    let all = store.list(&JobFilter::default(), 100).await.unwrap();
    assert_eq!(all.len(), 3);
}

pub(crate) async fn reused_id_is_reported_as_existing<S: JobStore>(store: &S) {
    let now = now();
    let original = keyed_job("t1", "k1", now);
    store.insert(&original).await.unwrap();

    let same_row = store.insert(&original).await.unwrap_err();
    assert!(
        matches!(same_row, StoreError::AlreadyExists(id) if id == original.id),
        "got {same_row:?}"
    );

    let mut rekeyed = original.clone();
    rekeyed.idempotency_key = Some(IdempotencyKey::new("k2").unwrap());
    let err = store.insert(&rekeyed).await.unwrap_err();
    assert!(
        matches!(err, StoreError::AlreadyExists(id) if id == original.id),
        "got {err:?}"
    );

    let other = keyed_job("t1", "k1", now);
    let err = store.insert(&other).await.unwrap_err();
    assert!(
        matches!(err, StoreError::DuplicateIdempotencyKey(ref k) if k.as_str() == "k1"),
        "got {err:?}"
    );
    assert!(store.get_by_idempotency_key(&IdempotencyKey::new("k2").unwrap()).await.unwrap().is_none());
}

pub(crate) async fn claim_is_fifo_and_exclusive<S: JobStore>(store: &S) {
    let t0 = now();
    let a = job("t1", "a", t0);
    let b = job("t1", "b", t0 + secs(1));
    // Same timestamp as `b`; insertion order decides.
    let c = job("t1", "c", t0 + secs(1));
    for j in [&c, &a, &b] {
        store.insert(j).await.unwrap();
    }

    let now = t0 + secs(5);
    let first = store.claim_next(now, LEASE).await.unwrap().unwrap();
    assert_eq!(first.id, a.id);
    assert_eq!(first.status, JobStatus::Running);
    assert_eq!(first.leased_until, Some(now + secs(30)));
    assert_eq!(first.updated_at, now);

    let second = store.claim_next(now, LEASE).await.unwrap().unwrap();
    let third = store.claim_next(now, LEASE).await.unwrap().unwrap();
    assert_eq!(second.id, c.id);
    assert_eq!(third.id, b.id);

    assert!(store.claim_next(now, LEASE).await.unwrap().is_none());
}

pub(crate) async fn expired_lease_is_reclaimed<S: JobStore>(store: &S) {
    let t0 = now();
    let j = job("t1", "a", t0);
    store.insert(&j).await.unwrap();

    let claimed = store.claim_next(t0, LEASE).await.unwrap().unwrap();
    assert_eq!(claimed.id, j.id);

    // Still leased at the exact expiry instant.
    let expiry = claimed.leased_until.unwrap();
    assert!(store.claim_next(expiry, LEASE).await.unwrap().is_none());

    let later = expiry + secs(1);
    let reclaimed = store.claim_next(later, LEASE).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, j.id);
    assert_eq!(reclaimed.retry_count, 0);
    assert_eq!(reclaimed.leased_until, Some(later + secs(30)));

    // The first holder lost its lease.
    let err = store.mark_done(j.id, expiry, later).await.unwrap_err();
    assert!(matches!(err, StoreError::LeaseLost(_)));

    store
        .mark_done(j.id, reclaimed.leased_until.unwrap(), later)
        .await
        .unwrap();
    let done = store.get_by_id(j.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Done);
    assert_eq!(done.leased_until, None);
}

pub(crate) async fn failed_jobs_until_dead_lettered<S: JobStore>(store: &S) {
    let mut now = now();
    let j = job("t1", "flaky", now);
    assert_eq!(j.max_retries, 3);
    store.insert(&j).await.unwrap();

    for attempt in 1..=3u32 {
        now += secs(1);
        let claimed = store.claim_next(now, LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.id, j.id);

        let transition = Transition::decide(&claimed, Outcome::failed("boom"));
        store
            .apply_transition(j.id, &transition, claimed.leased_until.unwrap(), now)
            .await
            .unwrap();

        let stored = store.get_by_id(j.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, attempt);
        assert_eq!(stored.leased_until, None);
    }

    let stored = store.get_by_id(j.id).await.unwrap().unwrap();
    assert!(stored.is_dead_lettered());
    assert_eq!(stored.error_message.as_deref(), Some("max retries exceeded"));

    now += secs(3600);
    assert!(store.claim_next(now, LEASE).await.unwrap().is_none());

    let metrics = store.metrics().await.unwrap();
    assert_eq!(metrics.dlq_jobs, 1);
    assert_eq!(metrics.failed_jobs, 0);
    assert_eq!(metrics.total_retries, 3);
}

pub(crate) async fn stale_lease_is_fenced<S: JobStore>(store: &S) {
    let now = now();
    let j = job("t1", "a", now);
    store.insert(&j).await.unwrap();

    // Not running yet.
    let err = store.mark_done(j.id, now, now).await.unwrap_err();
    assert!(matches!(err, StoreError::LeaseLost(_)));

    let err = store
        .mark_done(jobq_core::JobId::new(), now, now)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));

    let claimed = store.claim_next(now, LEASE).await.unwrap().unwrap();
    let lease = claimed.leased_until.unwrap();
    store.mark_done(j.id, lease, now + secs(1)).await.unwrap();

    // A second report for the same lease is rejected; Done stays Done.
    let err = store
        .mark_failed(j.id, 1, "late", lease, now + secs(2))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::LeaseLost(_)));
    let stored = store.get_by_id(j.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Done);
    assert_eq!(stored.error_message, None);
}

pub(crate) async fn list_filters_and_orders<S: JobStore>(store: &S) {
    let t0 = now();
    let a = job("t1", "a", t0);
    let b = job("t2", "b", t0 + secs(1));
    let c = job("t1", "c", t0 + secs(2));
    for j in [&a, &b, &c] {
        store.insert(j).await.unwrap();
    }
    store.claim_next(t0 + secs(3), LEASE).await.unwrap().unwrap();

    let all = store.list(&JobFilter::default(), 100).await.unwrap();
    let ids: Vec<_> = all.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![c.id, b.id, a.id]);

    let limited = store.list(&JobFilter::default(), 2).await.unwrap();
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].id, c.id);

    let t1 = TenantId::new("t1").unwrap();
    let tenant_only = store
        .list(&JobFilter::default().with_tenant(t1.clone()), 100)
        .await
        .unwrap();
    assert_eq!(tenant_only.len(), 2);
    assert!(tenant_only.iter().all(|j| j.tenant_id == t1));

    let running = store
        .list(&JobFilter::default().with_status(JobStatus::Running), 100)
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, a.id);

    let pending_t1 = store
        .list(
            &JobFilter::default()
                .with_status(JobStatus::Pending)
                .with_tenant(t1),
            100,
        )
        .await
        .unwrap();
    assert_eq!(pending_t1.len(), 1);
    assert_eq!(pending_t1[0].id, c.id);
}

pub(crate) async fn running_count_and_metrics<S: JobStore>(store: &S) {
    let now = now();
    for (i, tenant) in ["t1", "t1", "t1", "t2"].iter().enumerate() {
        store
            .insert(&job(tenant, "p", now + secs(i as i64)))
            .await
            .unwrap();
    }

    let later = now + secs(10);
    let first = store.claim_next(later, LEASE).await.unwrap().unwrap();
    store.claim_next(later, LEASE).await.unwrap().unwrap();

    let t1 = TenantId::new("t1").unwrap();
    let t2 = TenantId::new("t2").unwrap();
    assert_eq!(store.count_running(&t1).await.unwrap(), 2);
    assert_eq!(store.count_running(&t2).await.unwrap(), 0);

    store
        .mark_done(first.id, first.leased_until.unwrap(), later)
        .await
        .unwrap();
    assert_eq!(store.count_running(&t1).await.unwrap(), 1);

    let metrics = store.metrics().await.unwrap();
    assert_eq!(metrics.total_jobs, 4);
    assert_eq!(metrics.pending_jobs, 2);
    assert_eq!(metrics.running_jobs, 1);
    assert_eq!(metrics.completed_jobs, 1);
    assert_eq!(metrics.failed_jobs, 0);
    assert_eq!(metrics.dlq_jobs, 0);
}

pub(crate) async fn concurrent_claims_are_exclusive<S: JobStore + 'static>(store: Arc<S>) {
    let now = now();
    let total = 50;
    for i in 0..total {
        store
            .insert(&job("t1", &format!("job-{i}"), now))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            while let Some(job) = store.claim_next(now, LEASE).await.unwrap() {
                mine.push(job.id);
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "job {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), total);
}
