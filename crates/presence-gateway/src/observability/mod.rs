//! Observability for the Presence Gateway.
//!
//! # Privacy
//!
//! Request paths use `#[instrument(skip_all)]` and log only ids and sizes.
//! SDP bodies, ICE candidates and vital values never reach the logs.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `gw_connections_active` | Gauge | none | Live client connections |
//! | `gw_topics_active` | Gauge | none | Non-empty topics |
//! | `gw_calls_active` | Gauge | none | Ringing or connected calls |
//! | `gw_events_published_total` | Counter | `kind` | Domain events fanned out |
//! | `gw_messages_delivered_total` | Counter | none | Messages enqueued to connections |
//! | `gw_messages_dropped_total` | Counter | `reason` | Messages not enqueued |
//! | `gw_requests_total` | Counter | `event`, `outcome` | Client requests handled |
//! | `gw_request_latency_seconds` | Histogram | `event` | Client request latency |
//! | `gw_call_transitions_total` | Counter | `to` | Call state transitions |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
