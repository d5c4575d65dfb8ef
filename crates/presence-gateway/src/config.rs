//! Presence Gateway configuration.
//!
//! Configuration is loaded from environment variables. The TURN credential is
//! redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default bind address for the WebSocket, ingest and WebRTC HTTP server.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3001";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default CORS origin for the dashboard.
pub const DEFAULT_ALLOWED_ORIGIN: &str = "http://localhost:3000";

/// Default capacity of each connection's outbound queue.
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Default server keepalive ping interval in seconds.
pub const DEFAULT_KEEPALIVE_INTERVAL_SECONDS: u64 = 25;

/// Default number of recently ended call ids remembered.
pub const DEFAULT_ENDED_CALL_RETENTION: usize = 1024;

/// Default TURN base url.
pub const DEFAULT_TURN_URL: &str = "turn:localhost:3478";

/// Default TURN credential TTL reported to clients.
pub const DEFAULT_TURN_TTL_SECONDS: u64 = 3600;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(ConfigError::InvalidValue(format!(
                "GATEWAY_LOG_FORMAT must be 'text' or 'json', got '{other}'"
            ))),
        }
    }
}

/// TURN relay settings used to build ICE server lists.
#[derive(Clone)]
pub struct TurnConfig {
    /// TURN base url, e.g. `turn:turn.example.com:3478`.
    pub url: String,

    pub username: Option<String>,

    /// Protected by `SecretString` to prevent accidental logging.
    pub credential: Option<SecretString>,

    pub ttl_seconds: u64,
}

impl fmt::Debug for TurnConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field(
                "credential",
                &self.credential.as_ref().map(|_| "[REDACTED]"),
            )
            .field("ttl_seconds", &self.ttl_seconds)
            .finish()
    }
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_TURN_URL.to_string(),
            username: None,
            credential: None,
            ttl_seconds: DEFAULT_TURN_TTL_SECONDS,
        }
    }
}

/// Presence Gateway configuration.
#[derive(Clone)]
pub struct Config {
    /// WebSocket + HTTP bind address (default: "0.0.0.0:3001").
    pub bind_address: String,

    /// Health and metrics bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// CORS origin allowed to open connections.
    pub allowed_origin: String,

    /// Per-connection outbound queue capacity. A connection whose queue
    /// overflows is disconnected.
    pub outbound_queue_capacity: usize,

    /// Interval between server keepalive pings.
    pub keepalive_interval: Duration,

    /// Number of ended call ids remembered so late requests get
    /// `InvalidStateTransition` instead of `CallNotFound`.
    pub ended_call_retention: usize,

    pub log_format: LogFormat,

    pub turn: TurnConfig,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("allowed_origin", &self.allowed_origin)
            .field("outbound_queue_capacity", &self.outbound_queue_capacity)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("ended_call_retention", &self.ended_call_retention)
            .field("log_format", &self.log_format)
            .field("turn", &self.turn)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            health_bind_address: DEFAULT_HEALTH_BIND_ADDRESS.to_string(),
            allowed_origin: DEFAULT_ALLOWED_ORIGIN.to_string(),
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_INTERVAL_SECONDS),
            ended_call_retention: DEFAULT_ENDED_CALL_RETENTION,
            log_format: LogFormat::default(),
            turn: TurnConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Parse an optional positive integer variable, falling back to `default`.
fn parse_positive<T>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: fmt::Display,
{
    let Some(value_str) = vars.get(key) else {
        return Ok(default);
    };

    let value: T = value_str.trim().parse().map_err(|e| {
        ConfigError::InvalidValue(format!(
            "{key} must be a valid integer, got '{value_str}': {e}"
        ))
    })?;

    if value <= T::default() {
        return Err(ConfigError::InvalidValue(format!(
            "{key} must be greater than 0, got '{value_str}'"
        )));
    }

    Ok(value)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("GATEWAY_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("GATEWAY_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let allowed_origin = vars
            .get("GATEWAY_ALLOWED_ORIGIN")
            .cloned()
            .unwrap_or_else(|| DEFAULT_ALLOWED_ORIGIN.to_string());

        let outbound_queue_capacity = parse_positive(
            vars,
            "GATEWAY_OUTBOUND_QUEUE_CAPACITY",
            DEFAULT_OUTBOUND_QUEUE_CAPACITY,
        )?;

        let keepalive_seconds = parse_positive(
            vars,
            "GATEWAY_KEEPALIVE_INTERVAL_SECONDS",
            DEFAULT_KEEPALIVE_INTERVAL_SECONDS,
        )?;

        // Zero is allowed here: it disables tombstones entirely.
        let ended_call_retention = match vars.get("GATEWAY_ENDED_CALL_RETENTION") {
            Some(value_str) => value_str.trim().parse().map_err(|e| {
                ConfigError::InvalidValue(format!(
                    "GATEWAY_ENDED_CALL_RETENTION must be a valid integer, got '{value_str}': {e}"
                ))
            })?,
            None => DEFAULT_ENDED_CALL_RETENTION,
        };

        let log_format = match vars.get("GATEWAY_LOG_FORMAT") {
            Some(value) => value.parse()?,
            None => LogFormat::default(),
        };

        // TURN relay credentials come as a pair.
        let username = vars.get("TURN_USERNAME").filter(|s| !s.is_empty()).cloned();
        let credential = vars.get("TURN_CREDENTIAL").filter(|s| !s.is_empty());
        match (&username, credential) {
            (Some(_), None) => {
                return Err(ConfigError::MissingEnvVar("TURN_CREDENTIAL".to_string()))
            }
            (None, Some(_)) => return Err(ConfigError::MissingEnvVar("TURN_USERNAME".to_string())),
            _ => {}
        }

        let turn = TurnConfig {
            url: vars
                .get("TURN_URL")
                .cloned()
                .unwrap_or_else(|| DEFAULT_TURN_URL.to_string()),
            username,
            credential: credential.map(|s| SecretString::from(s.clone())),
            ttl_seconds: parse_positive(vars, "TURN_TTL_SECONDS", DEFAULT_TURN_TTL_SECONDS)?,
        };

        Ok(Config {
            bind_address,
            health_bind_address,
            allowed_origin,
            outbound_queue_capacity,
            keepalive_interval: Duration::from_secs(keepalive_seconds),
            ended_call_retention,
            log_format,
            turn,
        })
    }
}
