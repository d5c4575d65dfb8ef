//! Presence Gateway Library
//!
//! Real-time presence and call signaling for dashboard clients:
//!
//! - Live WebSocket connections, each admitted with a trusted identity claim
//! - Topic-based subscriptions (user, role, organization, patient, alert feed,
//!   call) guarded by a pure authorization check
//! - Fanout of vital, alert, notification, dashboard and device events pushed
//!   by external collaborators
//! - Call setup signaling between exactly two participants: lifecycle state
//!   machine, offer/answer/ICE relay, media toggles
//!
//! # Architecture
//!
//! ```text
//! Gateway (one per process, shared by Arc)
//! ├── ConnectionRegistry   connection id -> identity + outbound queue
//! ├── TopicIndex           topic -> member connections
//! ├── FanoutService        domain event -> topics -> queues
//! └── CallCoordinator      call table, busy set, ended-call memory
//!     └── CallActor        one task per live call, single writer
//! ```
//!
//! # Modules
//!
//! - [`gateway`] - The owning `Gateway` instance and request dispatch
//! - [`transport`] - WebSocket reader/writer tasks
//! - [`signaling`] - Call state machine and coordinator
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with wire error codes

pub mod authz;
pub mod config;
pub mod errors;
pub mod fanout;
pub mod gateway;
pub mod ice;
pub mod identity;
pub mod index;
pub mod observability;
pub mod protocol;
pub mod registry;
pub mod routes;
pub mod signaling;
pub mod topic;
pub mod transport;
