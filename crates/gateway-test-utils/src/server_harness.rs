//! Test server harness for E2E testing
//!
//! Provides `TestGatewayServer` for spawning real gateway instances in tests.

use presence_gateway::config::Config;
use presence_gateway::gateway::Gateway;
use presence_gateway::routes::{self, AppState};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Test harness for spawning a Presence Gateway in E2E tests.
///
/// Every instance owns its own `Gateway`, so tests never share connections,
/// topics or calls.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_stats_e2e() -> Result<(), anyhow::Error> {
///     let server = TestGatewayServer::spawn().await?;
///
///     let response = reqwest::get(format!("{}/stats", server.url())).await?;
///
///     assert_eq!(response.status(), 200);
///     Ok(())
/// }
/// ```
pub struct TestGatewayServer {
    addr: SocketAddr,
    gateway: Arc<Gateway>,
    config: Config,
    cancel_token: CancellationToken,
    _handle: JoinHandle<()>,
}

impl TestGatewayServer {
    /// Spawn a server with default test configuration.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with_vars(HashMap::new()).await
    }

    /// Spawn a server with extra environment-style configuration.
    ///
    /// The server will:
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Start the HTTP server in the background
    pub async fn spawn_with_vars(extra: HashMap<String, String>) -> Result<Self, anyhow::Error> {
        let mut vars = HashMap::from([
            ("GATEWAY_BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
            (
                "GATEWAY_HEALTH_BIND_ADDRESS".to_string(),
                "127.0.0.1:0".to_string(),
            ),
        ]);
        vars.extend(extra);

        let config = Config::from_vars(&vars)
            .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?;

        let cancel_token = CancellationToken::new();
        let gateway = Arc::new(Gateway::new(&config, cancel_token.child_token()));
        let state = Arc::new(AppState {
            gateway: Arc::clone(&gateway),
            config: config.clone(),
        });

        // Build routes using the gateway's real route builder
        let app = routes::build_routes(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            gateway,
            config,
            cancel_token,
            _handle: handle,
        })
    }

    /// Base HTTP URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// WebSocket URL for `/live` with the given handshake query.
    pub fn ws_url(&self, query: &str) -> String {
        if query.is_empty() {
            format!("ws://{}/live", self.addr)
        } else {
            format!("ws://{}/live?{}", self.addr, query)
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The gateway behind the server, for direct state assertions.
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Push a domain event through `POST /internal/events`.
    pub async fn publish(
        &self,
        event: &serde_json::Value,
    ) -> Result<serde_json::Value, anyhow::Error> {
        let response = reqwest::Client::new()
            .post(format!("{}/internal/events", self.url()))
            .json(event)
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::ACCEPTED {
            anyhow::bail!("publish returned {status}");
        }
        Ok(response.json().await?)
    }
}

impl Drop for TestGatewayServer {
    fn drop(&mut self) {
        // Close every connection and call, then stop accepting.
        self.cancel_token.cancel();
        self._handle.abort();
    }
}
