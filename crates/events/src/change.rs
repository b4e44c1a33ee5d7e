//! Queue change notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobq_core::{Job, JobId, QueueMetrics, TenantId, TraceId};

/// What happened to a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Submitted,
    Claimed,
    Completed,
    Retrying,
    DeadLettered,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Submitted => "submitted",
            ChangeKind::Claimed => "claimed",
            ChangeKind::Completed => "completed",
            ChangeKind::Retrying => "retrying",
            ChangeKind::DeadLettered => "dead_lettered",
        }
    }
}

/// A single state change, fired after submission and after every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueChange {
    pub kind: ChangeKind,
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub trace_id: TraceId,
    pub at: DateTime<Utc>,
}

impl QueueChange {
    pub fn for_job(kind: ChangeKind, job: &Job, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            job_id: job.id,
            tenant_id: job.tenant_id.clone(),
            trace_id: job.trace_id,
            at,
        }
    }
}

/// Broadcast payload: the change plus the current job list and metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<QueueChange>,
    pub jobs: Vec<Job>,
    pub metrics: QueueMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobq_core::NewJob;

    #[test]
    fn change_carries_job_identity() {
        let now = Utc::now();
        let job = Job::create(NewJob::new(TenantId::new("t1").unwrap(), "p"), now).unwrap();
        let change = QueueChange::for_job(ChangeKind::Submitted, &job, now);

        assert_eq!(change.job_id, job.id);
        assert_eq!(change.trace_id, job.trace_id);

        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["kind"], "submitted");
    }
}
