// Telemetry processing engine — local-only pipeline between IDE capture
// agents and local consumers (CLIs, dashboards, analysis tools).
//
// Architecture:
// - Durable queue (in-process): `events` / `events.dlq` / `cdc` streams
// - Fast-path ingestor: dedicated writer thread, batches into the raw store
// - Slow-path worker pool: tokio tasks, sticky-partitioned by session id
// - Composite updater: singleton tokio task computing cross-session metrics
// - HTTP surface (axum): event intake plus a read-only query API
//
// All state lives in one on-disk SQLite file; there is no cloud egress.

use std::sync::Arc;

use telemetry_engine::cli;
use telemetry_engine::config::Config;
use telemetry_engine::http::{self, EngineState};
use telemetry_engine::supervisor::Supervisor;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Handle CLI subcommands first (config/dlq/health/demo). `serve` and
    // bare invocation both fall through to starting the engine.
    if let Some(code) = cli::handle_cli() {
        std::process::exit(code);
    }

    Config::ensure_config_exists();
    let config = Config::from_env();

    let default_filter = "telemetry_engine=info,tower_http=info,axum=info";
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        version = telemetry_engine::config::VERSION,
        data_dir = %config.data_dir.display(),
        bind_addr = %config.bind_addr,
        worker_count = config.slow_path.worker_count,
        "telemetry-engine: starting"
    );

    let bind_addr = config.bind_addr.clone();
    let supervisor = Arc::new(Supervisor::start(config)?);

    let state = EngineState {
        supervisor: supervisor.clone(),
    };
    let router = http::router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind_addr = %bind_addr, "telemetry-engine: HTTP intake and read surface listening");

    // Awaited directly rather than spawned: `with_graceful_shutdown` only
    // returns once in-flight requests drain, which guarantees every other
    // clone of `supervisor` held by a handler is gone by the time this
    // await resolves — letting the `Arc::into_inner` below always succeed.
    axum::serve(listener, router)
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await?;

    tracing::info!("telemetry-engine: shutdown signal received, draining");
    let supervisor = Arc::into_inner(supervisor)
        .expect("HTTP server fully drained before this point, so no handler still holds a clone");
    supervisor.shutdown().await;

    tracing::info!("telemetry-engine: shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
