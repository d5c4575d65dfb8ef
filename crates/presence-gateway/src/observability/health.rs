//! Health and metrics endpoints.
//!
//! Served on a separate listener from the client-facing server:
//! - `GET /health` - liveness
//! - `GET /ready` - readiness (set once the gateway listener is bound,
//!   cleared when shutdown begins)
//! - `GET /metrics` - Prometheus text format, when a recorder handle is given

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Liveness and readiness flags shared between `main` and the health server.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    ready: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (live=true, ready=false).
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Stop advertising readiness, e.g. while draining connections.
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Serialize)]
struct ProbeBody {
    status: &'static str,
}

#[derive(Clone)]
struct HealthRouterState {
    health: Arc<HealthState>,
    metrics: Option<PrometheusHandle>,
}

/// Build the health router.
///
/// `metrics` is `None` in tests that don't install a recorder; `/metrics`
/// then returns 404.
pub fn health_router(health_state: Arc<HealthState>, metrics: Option<PrometheusHandle>) -> Router {
    let state = HealthRouterState {
        health: health_state,
        metrics,
    };

    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn liveness_handler(
    State(state): State<HealthRouterState>,
) -> (StatusCode, Json<ProbeBody>) {
    if state.health.is_live() {
        (StatusCode::OK, Json(ProbeBody { status: "live" }))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProbeBody { status: "down" }),
        )
    }
}

async fn readiness_handler(
    State(state): State<HealthRouterState>,
) -> (StatusCode, Json<ProbeBody>) {
    if state.health.is_ready() {
        (StatusCode::OK, Json(ProbeBody { status: "ready" }))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProbeBody {
                status: "not_ready",
            }),
        )
    }
}

async fn metrics_handler(State(state): State<HealthRouterState>) -> (StatusCode, String) {
    match state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}
