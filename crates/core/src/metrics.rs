//! Aggregate queue metrics.

use serde::{Deserialize, Serialize};

use crate::job::{Job, JobStatus};

/// Counts over the whole job table.
///
/// `failed_jobs` counts only schedulable failures; terminal failures are
/// reported under `dlq_jobs`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub total_jobs: u64,
    pub pending_jobs: u64,
    pub running_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub dlq_jobs: u64,
    pub total_retries: u64,
}

impl QueueMetrics {
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let mut m = Self::default();
        for job in jobs {
            m.record(job);
        }
        m
    }

    pub fn record(&mut self, job: &Job) {
        self.total_jobs += 1;
        self.total_retries += u64::from(job.retry_count);
        match job.status {
            JobStatus::Pending => self.pending_jobs += 1,
            JobStatus::Running => self.running_jobs += 1,
            JobStatus::Done => self.completed_jobs += 1,
            JobStatus::Failed if job.is_dead_lettered() => self.dlq_jobs += 1,
            JobStatus::Failed => self.failed_jobs += 1,
        }
    }
}
