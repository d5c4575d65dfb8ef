//! Client transport.
//!
//! Dashboard clients connect over a WebSocket at `/live`. Each connection runs
//! a reader loop that dispatches requests into the [`crate::gateway::Gateway`]
//! and a writer task that drains the connection's outbound queue.

pub mod ws;

pub use ws::ws_handler;
