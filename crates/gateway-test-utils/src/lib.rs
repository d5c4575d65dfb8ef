//! # Gateway Test Utilities
//!
//! Shared test utilities for the Presence Gateway.
//!
//! This crate provides:
//! - Server test harness (`TestGatewayServer` for E2E tests)
//! - WebSocket client speaking the gateway frame protocol (`WsTestClient`)
//! - Identity and domain event fixtures
//!
//! ## Usage
//!
//! ```rust,ignore
//! use gateway_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<(), anyhow::Error> {
//!     let server = TestGatewayServer::spawn().await?;
//!     let mut client = WsTestClient::connect(&server, &TestIdentity::provider("u2")).await?;
//!
//!     client.expect_event("connected").await?;
//!     let ack = client.request("subscribe:alerts", serde_json::json!({})).await?;
//!     assert_eq!(ack["success"], true);
//!     Ok(())
//! }
//! ```

pub mod fixtures;
pub mod server_harness;
pub mod ws_client;

// Re-export commonly used items
pub use fixtures::*;
pub use server_harness::*;
pub use ws_client::*;
