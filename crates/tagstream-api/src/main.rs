use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use tagstream_api::rest::{self, AppState};
use tagstream_core::{Config, EventBus};
use tagstream_observability::{init_observability, metrics::start_metrics_server};
use tagstream_pipeline::{
    dedup::DEFAULT_MAX_BUFFER_SIZE, filter::DEFAULT_BATCH_SIZE, BusSink, PipelineConfig,
    ReadDeduplicator, ReadFilter, ReadPipeline,
};
use tagstream_session::SessionManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;

    init_observability();
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    start_metrics_server(metrics_addr);

    info!(
        "Starting tagstream reader service v{}",
        env!("CARGO_PKG_VERSION")
    );

    let bus = Arc::new(EventBus::new(10_000));

    let filter = ReadFilter::new(config.quality_threshold, DEFAULT_BATCH_SIZE)?;
    let dedup = ReadDeduplicator::new(
        config.read_window_seconds,
        config.signal_threshold_dbm,
        DEFAULT_MAX_BUFFER_SIZE,
    )?;
    let pipeline_config = PipelineConfig {
        queue_capacity: config.queue_size_limit,
        ..PipelineConfig::default()
    };
    let pipeline = Arc::new(ReadPipeline::new(
        pipeline_config,
        filter,
        dedup,
        Arc::new(BusSink::new(Arc::clone(&bus))),
    ));
    pipeline.start();

    let manager = SessionManager::new(Arc::clone(&pipeline), Some(Arc::clone(&bus)));

    let state = AppState {
        manager: Arc::clone(&manager),
        pipeline: Arc::clone(&pipeline),
    };
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!("admin API listening on {}", config.bind_addr);

    axum::serve(listener, rest::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutdown signal received, draining");
    manager.shutdown().await;
    pipeline.stop().await;
    info!("tagstream reader service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
