//! Metrics definitions for the Presence Gateway.
//!
//! All metrics follow Prometheus naming conventions:
//! - `gw_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded enums, never ids:
//! - `kind`: 5 domain event kinds
//! - `reason`: `queue_full`, `closed`
//! - `event`: 12 client request names plus `invalid`
//! - `outcome`: `success` or an error code (9 values)
//! - `to`: 3 call states

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Request handling is in-memory; most requests finish well under 10ms
        .set_buckets_for_metric(
            Matcher::Prefix("gw_request".to_string()),
            &[
                0.0005, 0.001, 0.0025, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250,
            ],
        )
        .map_err(|e| format!("Failed to set request latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Set the number of live client connections.
///
/// Metric: `gw_connections_active`
pub fn set_connections_active(count: usize) {
    // usize to f64 conversion is safe for realistic connection counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("gw_connections_active").set(count as f64);
}

/// Set the number of non-empty topics.
///
/// Metric: `gw_topics_active`
pub fn set_topics_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("gw_topics_active").set(count as f64);
}

/// Set the number of ringing or connected calls.
///
/// Metric: `gw_calls_active`
pub fn set_calls_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("gw_calls_active").set(count as f64);
}

// ============================================================================
// Fanout
// ============================================================================

/// Record a domain event accepted for fanout.
///
/// Metric: `gw_events_published_total`
/// Labels: `kind` (vital, alert, notification, dashboard, device_status)
pub fn record_event_published(kind: &str) {
    counter!("gw_events_published_total", "kind" => kind.to_string()).increment(1);
}

/// Record a message enqueued onto a connection's outbound queue.
///
/// Metric: `gw_messages_delivered_total`
pub fn record_message_delivered() {
    counter!("gw_messages_delivered_total").increment(1);
}

/// Record a message that could not be enqueued.
///
/// Metric: `gw_messages_dropped_total`
/// Labels: `reason` (`queue_full`, `closed`)
///
/// `queue_full` also means the slow connection was disconnected.
pub fn record_message_dropped(reason: &str) {
    counter!("gw_messages_dropped_total", "reason" => reason.to_string()).increment(1);
}

// ============================================================================
// Requests
// ============================================================================

/// Record a handled client request and its latency.
///
/// Metrics: `gw_requests_total`, `gw_request_latency_seconds`
/// Labels: `event`, `outcome` (`success` or the wire error code)
pub fn record_request(event: &str, outcome: &str, duration: Duration) {
    counter!("gw_requests_total",
        "event" => event.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!("gw_request_latency_seconds", "event" => event.to_string())
        .record(duration.as_secs_f64());
}

// ============================================================================
// Calls
// ============================================================================

/// Record a call state transition.
///
/// Metric: `gw_call_transitions_total`
/// Labels: `to` (ringing, connected, ended)
pub fn record_call_transition(to: &str) {
    counter!("gw_call_transitions_total", "to" => to.to_string()).increment(1);
}
