//! Logwarden -- self-hosted log analytics and anomaly detection.
//!
//! This crate provides the core library: a time-sharded event store, a
//! pipeline query engine, windowed aggregation, online anomaly detection,
//! alert dispatch, scheduled detection jobs, and the HTTP API.

pub mod alert;
pub mod api;
pub mod config;
pub mod detect;
pub mod error;
pub mod event;
pub mod query;
pub mod scheduler;
pub mod storage;
pub mod window;

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api::state::AppState;
use crate::config::{EngineConfig, LogFormat, LoggingConfig};
use crate::scheduler::DetectionRunner;
use crate::storage::EventStore;

/// Install the global subscriber. `RUST_LOG` overrides `logging.level`.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Evict expired shards and idle detector state every `interval` until
/// `shutdown` fires.
pub async fn run_retention_loop(
    store: EventStore,
    runner: DetectionRunner,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let store = store.clone();
        match tokio::task::spawn_blocking(move || store.purge_expired(Utc::now())).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(error = %e, "retention sweep failed"),
            Err(e) => error!(error = %e, "retention sweep task panicked"),
        }
        runner.prune(Utc::now());
    }
}

/// Start the Logwarden daemon: API server, scheduler, and retention sweep.
pub async fn serve(config: EngineConfig) -> Result<()> {
    // 1. Initialize storage and engine components
    let state = AppState::from_config(config)?;
    let shutdown = CancellationToken::new();

    // 2. Start retention sweep (background task)
    tokio::spawn(run_retention_loop(
        state.store.clone(),
        state.runner.clone(),
        state.config.storage.sweep_interval,
        shutdown.clone(),
    ));

    // 3. Start Scheduler Engine (background task)
    tokio::spawn(scheduler::run_scheduler_loop(
        state.scheduler.clone(),
        state.runner.clone(),
        state.config.engine.bucket_size,
        shutdown.clone(),
    ));

    // 4. Start API Server
    let addr: std::net::SocketAddr = state
        .config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", state.config.api.bind))?;
    let app = api::router(state);

    info!(%addr, "Logwarden listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            stop.cancel();
        })
        .await?;

    shutdown.cancel();
    Ok(())
}
