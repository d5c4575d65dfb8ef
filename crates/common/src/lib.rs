//! Common utilities and types shared across the presence gateway crates.

#![warn(clippy::pedantic)]

/// Module for identifier types shared between the gateway and its test tooling
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;
