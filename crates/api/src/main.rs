use std::sync::Arc;

use anyhow::Context;

use jobq_infra::QueueConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobq_observability::init();

    let config = QueueConfig::from_env().context("invalid configuration")?;
    let bind_addr = config.bind_addr;

    let services = jobq_api::app::build_services(config)
        .await
        .context("failed to open job store")?;
    let services = Arc::new(services);

    let workers = services.start_workers();
    let app = jobq_api::app::build_app(Arc::clone(&services));

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("shutting down workers");
    workers.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
