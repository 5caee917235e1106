//! MediaScan service binary: HTTP/WS gateway plus the in-process worker pool.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mscan_api::{
    create_router, metrics, ApiConfig, AppState, CacheSweeper, RateLimitSweeper, RetentionSweeper,
};
use mscan_cache::ContentCache;
use mscan_detector::HttpDetector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    // Install rustls crypto provider (required for rustls 0.23+)
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider already installed");
    }
    info!("Starting mscan-api");

    let config = ApiConfig::from_env();
    info!(
        host = %config.host,
        port = config.port,
        environment = %config.environment,
        production = config.is_production(),
        worker_slots = config.worker.effective_slots(),
        rate_limit_per_minute = config.dispatcher.rate_limit_per_minute,
        "Loaded configuration"
    );

    let cache = ContentCache::from_config(&config.cache).context("failed to create cache")?;
    let detector =
        HttpDetector::new(config.detector.clone()).context("failed to create detector client")?;
    let state = AppState::new(config.clone(), cache, Arc::new(detector));

    let metrics_handle = if config.metrics_enabled {
        match metrics::init_metrics() {
            Ok(handle) => {
                info!("Prometheus metrics enabled at /metrics");
                Some(handle)
            }
            Err(e) => {
                error!("Failed to install Prometheus recorder: {}", e);
                None
            }
        }
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(
        CacheSweeper::new(state.cache.clone(), config.cache.sweep_interval).run(shutdown_rx.clone()),
    );
    tokio::spawn(
        RateLimitSweeper::new(state.dispatcher.clone(), Duration::from_secs(60))
            .run(shutdown_rx.clone()),
    );
    if let Some(retention) = config.job_retention {
        tokio::spawn(
            RetentionSweeper::new(
                state.store.clone(),
                state.broadcaster.clone(),
                retention,
                config.retention_sweep_interval,
            )
            .run(shutdown_rx.clone()),
        );
    } else {
        info!("Job retention disabled");
    }

    let executor = state.executor.clone();
    let executor_task = tokio::spawn(executor.clone().run());

    let app = create_router(state.clone(), metrics_handle);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid bind address")?;

    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    info!("HTTP server stopped, draining workers");
    let _ = shutdown_tx.send(true);
    executor.shutdown();
    match executor_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Executor stopped with error: {}", e),
        Err(e) => error!("Executor task failed: {}", e),
    }

    info!("Shutdown complete");
    Ok(())
}

/// Colored output for dev, JSON when `LOG_FORMAT=json`.
fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
