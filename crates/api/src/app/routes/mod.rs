use axum::{Router, routing::get};

pub mod jobs;
pub mod system;

/// Router for everything under `/api`.
pub fn router() -> Router {
    Router::new()
        .nest("/jobs", jobs::router())
        .route("/metrics", get(system::metrics))
        .route("/snapshot", get(system::snapshot))
        .route("/stream", get(system::stream))
}
