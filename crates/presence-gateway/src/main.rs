//! Presence Gateway
//!
//! Real-time presence and call signaling server for dashboard clients.
//!
//! # Servers
//!
//! - HTTP/WebSocket server for clients and collaborators (default: 0.0.0.0:3001)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing (text or JSON)
//! 3. Initialize Prometheus metrics recorder
//! 4. Create the `Gateway`
//! 5. Start health HTTP server (liveness, readiness, metrics)
//! 6. Bind the client listener, mark ready
//! 7. Wait for shutdown signal, then close every connection and call

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use presence_gateway::config::{Config, LogFormat};
use presence_gateway::gateway::Gateway;
use presence_gateway::observability::{health_router, init_metrics_recorder, HealthState};
use presence_gateway::routes::{self, AppState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound on waiting for open connections after shutdown begins.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Configuration decides the log format, so load it first and report
    // failures once tracing is up.
    let config = Config::from_env();
    init_tracing(
        config
            .as_ref()
            .map(|c| c.log_format)
            .unwrap_or_default(),
    );

    info!("Starting Presence Gateway");

    let config = config.map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        allowed_origin = %config.allowed_origin,
        outbound_queue_capacity = config.outbound_queue_capacity,
        keepalive_interval_seconds = config.keepalive_interval.as_secs(),
        ended_call_retention = config.ended_call_retention,
        turn_url = %config.turn.url,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());
    let shutdown_token = CancellationToken::new();
    let gateway = Arc::new(Gateway::new(&config, shutdown_token.child_token()));

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_app = health_router(Arc::clone(&health_state), Some(prometheus_handle));
    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Client-facing server
    let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        format!("Invalid bind address: {e}")
    })?;

    let state = Arc::new(AppState {
        gateway: Arc::clone(&gateway),
        config,
    });
    let app = routes::build_routes(state);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(error = %e, addr = %addr, "Failed to bind gateway listener");
        format!("Failed to bind gateway listener to {addr}: {e}")
    })?;

    let server_shutdown_token = shutdown_token.child_token();
    let server = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_shutdown_token.cancelled().await;
        });
        if let Err(e) = server.await {
            error!(error = %e, "Gateway server failed");
        }
    });

    health_state.set_ready();
    info!(addr = %addr, "Presence Gateway listening");

    shutdown_signal().await;

    // Mark as not ready immediately so the load balancer stops sending traffic
    health_state.set_not_ready();

    // Closing every connection lets the server's graceful shutdown finish
    gateway.shutdown();
    shutdown_token.cancel();

    if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, server)
        .await
        .is_err()
    {
        warn!(
            grace_period_secs = SHUTDOWN_GRACE_PERIOD.as_secs(),
            "Gateway server did not stop within grace period"
        );
    }

    info!("Presence Gateway shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "presence_gateway=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
