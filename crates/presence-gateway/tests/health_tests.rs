//! Health endpoint integration tests.
//!
//! Serves the health router on a real listener, the way `main` does, and
//! probes it over HTTP.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use presence_gateway::observability::metrics;
use presence_gateway::observability::{health_router, HealthState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

async fn serve_health(
    state: Arc<HealthState>,
    handle: Option<PrometheusHandle>,
) -> Result<SocketAddr, anyhow::Error> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = health_router(state, handle);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            eprintln!("Health server error: {}", e);
        }
    });
    Ok(addr)
}

/// Liveness is reported as soon as the process is up.
#[tokio::test]
async fn test_health_endpoint_returns_200() -> Result<(), anyhow::Error> {
    let addr = serve_health(Arc::new(HealthState::new()), None).await?;

    let response = reqwest::get(format!("http://{addr}/health")).await?;

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["status"], "live");
    Ok(())
}

/// Readiness flips with the shared state and drops again on shutdown.
#[tokio::test]
async fn test_ready_follows_lifecycle() -> Result<(), anyhow::Error> {
    let state = Arc::new(HealthState::new());
    let addr = serve_health(Arc::clone(&state), None).await?;
    let url = format!("http://{addr}/ready");

    let response = reqwest::get(&url).await?;
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["status"], "not_ready");

    state.set_ready();
    assert_eq!(reqwest::get(&url).await?.status(), 200);

    state.set_not_ready();
    assert_eq!(reqwest::get(&url).await?.status(), 503);
    Ok(())
}

/// Gateway metrics show up in the Prometheus exposition.
#[tokio::test]
async fn test_metrics_render_gateway_series() -> Result<(), anyhow::Error> {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    ::metrics::with_local_recorder(&recorder, || {
        metrics::record_event_published("vital");
        metrics::record_request("ping", "success", Duration::from_millis(2));
        metrics::set_connections_active(3);
    });

    let addr = serve_health(Arc::new(HealthState::new()), Some(handle)).await?;
    let response = reqwest::get(format!("http://{addr}/metrics")).await?;
    assert_eq!(response.status(), 200);

    let body = response.text().await?;
    assert!(body.contains("gw_events_published_total"), "{body}");
    assert!(body.contains(r#"kind="vital""#), "{body}");
    assert!(body.contains("gw_requests_total"), "{body}");
    assert!(body.contains("gw_connections_active 3"), "{body}");
    Ok(())
}
