//! Call Controller
//!
//! Application-server process of the audio-call subsystem.
//!
//! # Servers
//!
//! - HTTP server for health endpoints and Prometheus metrics (default: 0.0.0.0:8082)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing and the Prometheus metrics recorder
//! 3. Start `CallService` (first heartbeat, routing, heartbeat and reaper tasks)
//! 4. Start health HTTP server (liveness, readiness, metrics)
//! 5. Wait for shutdown signal, then shut down cleanly
//!
//! This binary runs in development mode: the document store is in memory
//! and the SFU is the in-process bookkeeping implementation.

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use call_controller::auth::AllowAll;
use call_controller::config::Config;
use call_controller::observability::{health_router, metrics};
use call_controller::service::CallService;
use call_controller::sfu::InProcessSfu;
use call_controller::store::MemoryStore;
use common::config::ObservabilityConfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    common::logging::init_tracing(&ObservabilityConfig::for_crate(
        "call_controller",
        config.log_json,
    ))
    .context("failed to initialize tracing")?;

    info!(
        server_id = %config.server_id,
        enabled = config.enabled,
        crowd_threshold = config.crowd_threshold,
        health_bind_address = %config.health_bind_address,
        "Configuration loaded successfully"
    );

    let prometheus_handle = metrics::init_metrics_recorder().map_err(anyhow::Error::msg)?;

    warn!("Running with in-memory store and in-process SFU");
    let service = CallService::start(
        config.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(InProcessSfu::new()),
        Arc::new(AllowAll),
    )
    .await
    .context("failed to start call service")?;

    // Bind before spawning to fail fast on bind errors.
    let health_addr: SocketAddr = config
        .health_bind_address
        .parse()
        .with_context(|| format!("invalid health bind address {}", config.health_bind_address))?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let app = health_router(service.health())
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .with_context(|| format!("failed to bind health server to {health_addr}"))?;
    info!(addr = %health_addr, "Health server bound successfully");

    let http_shutdown = CancellationToken::new();
    let http_token = http_shutdown.clone();
    let http_task = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            http_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    info!("Call Controller running - press Ctrl+C to shutdown");
    shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown...");

    if let Err(e) = service.shutdown().await {
        warn!(error = %e, "Call service shutdown error");
    }
    http_shutdown.cancel();
    if let Err(e) = http_task.await {
        warn!(error = %e, "Health server task failed");
    }

    info!("Call Controller shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
