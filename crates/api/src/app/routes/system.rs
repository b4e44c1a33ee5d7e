use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::Extension,
    http::StatusCode,
    response::{
        IntoResponse,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
};
use tokio_stream::{StreamExt, wrappers::BroadcastStream};
use tracing::debug;

use jobq_infra::JobStore;

use crate::app::errors;
use crate::app::services::AppServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// GET /api/metrics
pub async fn metrics(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.store.metrics().await {
        Ok(m) => Json(m).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /api/snapshot
///
/// Current job list and metrics; the polling fallback for `/api/stream`.
pub async fn snapshot(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.broadcaster.snapshot(None).await {
        Ok(s) => Json(s).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /api/stream
///
/// One `snapshot` event per queue change. Lagging clients skip the snapshots
/// they missed; the next one carries the full state anyway.
pub async fn stream(
    Extension(services): Extension<Arc<AppServices>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = services.realtime_tx().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(snapshot) => {
            let data = serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string());
            Some(Ok(SseEvent::default().event("snapshot").data(data)))
        }
        Err(e) => {
            debug!(error = %e, "sse client lagged");
            None
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
