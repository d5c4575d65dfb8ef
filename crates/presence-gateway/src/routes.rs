//! HTTP routes for the Presence Gateway.
//!
//! Defines the Axum router and application state.

use crate::config::Config;
use crate::errors::GatewayError;
use crate::fanout::{DomainEvent, FanoutReport};
use crate::gateway::{Gateway, GatewayStats};
use crate::ice::{ice_configuration, IceConfiguration};
use crate::registry::ConnectionInfo;
use crate::transport;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderValue, Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,

    /// Service configuration.
    pub config: Config,
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `/live` - WebSocket endpoint for dashboard clients
/// - `/internal/events` - domain event ingest from collaborators
/// - `/webrtc/turn-credentials` - ICE servers for call setup
/// - `/stats`, `/stats/connections` - live counts and connection listing
/// - TraceLayer for request logging, CORS for the dashboard origin
pub fn build_routes(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.allowed_origin);

    Router::new()
        .route("/live", get(transport::ws_handler))
        .route("/internal/events", post(ingest_event))
        .route("/webrtc/turn-credentials", get(turn_credentials))
        .route("/stats", get(stats))
        .route("/stats/connections", get(connections))
        .with_state(state)
        // Layer order (bottom-to-top execution):
        // 1. TraceLayer - Log request details
        // 2. CorsLayer - Answer preflight before tracing
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

fn cors_layer(allowed_origin: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true);

    match allowed_origin.parse::<HeaderValue>() {
        Ok(origin) => layer.allow_origin(origin),
        Err(e) => {
            warn!(
                target: "gw.http",
                origin = %allowed_origin,
                error = %e,
                "Invalid allowed origin, cross-origin requests will be refused"
            );
            layer
        }
    }
}

/// `POST /internal/events`
async fn ingest_event(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DomainEvent>, JsonRejection>,
) -> Result<(StatusCode, Json<FanoutReport>), GatewayError> {
    let Json(event) =
        payload.map_err(|e| GatewayError::InvalidMessage(format!("invalid event: {e}")))?;

    let kind = event.kind();
    let report = state.gateway.publish(event).await;

    info!(
        target: "gw.http",
        kind,
        topics = report.topics.len(),
        delivered = report.delivered,
        "Domain event ingested"
    );
    Ok((StatusCode::ACCEPTED, Json(report)))
}

/// `GET /webrtc/turn-credentials`
async fn turn_credentials(State(state): State<Arc<AppState>>) -> Json<IceConfiguration> {
    Json(ice_configuration(&state.config.turn))
}

/// `GET /stats`
async fn stats(State(state): State<Arc<AppState>>) -> Json<GatewayStats> {
    Json(state.gateway.stats().await)
}

/// `GET /stats/connections`
async fn connections(State(state): State<Arc<AppState>>) -> Json<Vec<ConnectionInfo>> {
    let connections = state.gateway.registry().all().await;
    Json(connections.iter().map(ConnectionInfo::from).collect())
}
