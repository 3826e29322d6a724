use std::sync::Arc;

use anyhow::{Context, Result};
use beach_mcp::{
    build_router, telemetry::Telemetry, AppState, Cli, CloseReason, SessionTable, ToolRegistry,
    TransportConfig,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = TransportConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        allowed_origins = ?config.allowed_origins,
        protocol_versions = ?config.protocol_versions,
        idle_timeout_secs = config.idle_timeout.map(|timeout| timeout.as_secs()),
        "starting beach-mcp"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: TransportConfig, metrics: PrometheusHandle) -> Result<()> {
    let dispatcher = Arc::new(ToolRegistry::with_diagnostics());
    let state = AppState::new(&config, dispatcher).with_metrics(metrics);
    let sessions = state.sessions().clone();
    let reaper_handle = sessions.spawn_reaper();

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("beach-mcp listening on {}", config.listen_addr);

    let graceful =
        axum::serve(listener, router).with_graceful_shutdown(shutdown_signal(sessions.clone()));
    graceful.await.context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    if let Some(handle) = reaper_handle {
        handle.abort();
    }
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

/// Resolves on ctrl-c after closing every session, so open SSE responses end
/// and the server can drain.
async fn shutdown_signal(sessions: SessionTable) {
    let _ = signal::ctrl_c().await;
    let closed = sessions.close_all(CloseReason::Shutdown);
    info!(closed, "closed sessions for shutdown");
}
