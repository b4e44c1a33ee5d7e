use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobq_core::{Job, JobStatus, TenantId};
use jobq_infra::JobFilter;
use jobq_infra::jobs::SubmitJob;

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

/// Body of `POST /api/jobs`.
///
/// Required fields are optional here so that a missing field is reported as
/// a validation error rather than a deserialization failure.
#[derive(Debug, Default, Deserialize)]
pub struct SubmitJobRequest {
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// A JSON string is passed through verbatim; any other JSON value is
    /// stored as its serialized text.
    #[serde(default)]
    pub payload: Option<JsonValue>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl SubmitJobRequest {
    pub fn into_submission(self) -> SubmitJob {
        let payload = match self.payload {
            None | Some(JsonValue::Null) => String::new(),
            Some(JsonValue::String(s)) => s,
            Some(other) => other.to_string(),
        };

        SubmitJob {
            tenant_id: self.tenant_id.unwrap_or_default(),
            payload,
            idempotency_key: self.idempotency_key,
            max_retries: self.max_retries,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub tenant_id: Option<String>,
    pub limit: Option<usize>,
}

/// Upper bound on `limit` for listings.
pub const MAX_LIST_LIMIT: usize = 1_000;

impl ListJobsQuery {
    pub fn filter(&self) -> Result<JobFilter, axum::response::Response> {
        let mut filter = JobFilter::default();

        if let Some(status) = self.status.as_deref().filter(|s| !s.trim().is_empty()) {
            let status: JobStatus = status.parse().map_err(|e: jobq_core::DomainError| {
                errors::json_error(
                    axum::http::StatusCode::BAD_REQUEST,
                    "invalid_status",
                    e.to_string(),
                )
            })?;
            filter = filter.with_status(status);
        }

        if let Some(tenant) = self.tenant_id.as_deref().filter(|s| !s.trim().is_empty()) {
            let tenant = TenantId::new(tenant).map_err(|e| {
                errors::json_error(
                    axum::http::StatusCode::BAD_REQUEST,
                    "invalid_tenant",
                    e.to_string(),
                )
            })?;
            filter = filter.with_tenant(tenant);
        }

        Ok(filter)
    }

    pub fn limit(&self, default: usize) -> usize {
        self.limit.unwrap_or(default).clamp(1, MAX_LIST_LIMIT)
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub count: usize,
    pub jobs: Vec<Job>,
}

impl From<Vec<Job>> for JobListResponse {
    fn from(jobs: Vec<Job>) -> Self {
        Self {
            count: jobs.len(),
            jobs,
        }
    }
}
