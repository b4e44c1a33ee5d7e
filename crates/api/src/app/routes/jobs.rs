use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, rejection::{JsonRejection, QueryRejection}},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};

use jobq_core::JobId;
use jobq_infra::JobStore;
use jobq_infra::jobs::Submission;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_jobs).post(submit_job))
        .route("/:id", get(get_job))
}

/// POST /api/jobs
///
/// 201 with the new job, or 200 with the existing job when the idempotency
/// key has been seen before.
pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<dto::SubmitJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };

    match services.gateway.submit(body.into_submission()).await {
        Ok(Submission::Created(job)) => (StatusCode::CREATED, Json(job)).into_response(),
        Ok(Submission::Existing(job)) => (StatusCode::OK, Json(job)).into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}

/// GET /api/jobs?status=&tenant_id=&limit=
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    query: Result<Query<dto::ListJobsQuery>, QueryRejection>,
) -> axum::response::Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(rejection) => return errors::query_rejection_to_response(rejection),
    };

    let filter = match query.filter() {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    let limit = query.limit(services.config.list_limit);

    match services.store.list(&filter, limit).await {
        Ok(jobs) => Json(dto::JobListResponse::from(jobs)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /api/jobs/:id
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match JobId::from_str(&id) {
        Ok(id) => id,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id");
        }
    };

    match services.store.get_by_id(id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("job {id} not found"),
        ),
        Err(e) => errors::store_error_to_response(e),
    }
}
