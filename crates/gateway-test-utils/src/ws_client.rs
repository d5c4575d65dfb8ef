//! WebSocket test client speaking the gateway frame protocol.
//!
//! Frames that arrive while the client waits for something else are buffered,
//! so tests can assert on events in the order they were sent.

use crate::fixtures::TestIdentity;
use crate::server_harness::TestGatewayServer;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// How long to wait for an expected frame before failing.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A server frame: `{"event": ..., "data": ...}`.
#[derive(Debug, Clone)]
pub struct ServerFrame {
    pub event: String,
    pub data: Value,
    /// The frame text exactly as received.
    pub raw: String,
}

pub struct WsTestClient {
    stream: WsStream,
    buffer: VecDeque<ServerFrame>,
    next_ack_id: u64,
}

impl WsTestClient {
    /// Connect to `/live` as `identity`.
    pub async fn connect(
        server: &TestGatewayServer,
        identity: &TestIdentity,
    ) -> Result<Self, anyhow::Error> {
        let (stream, _response) = connect_async(server.ws_url(&identity.query())).await?;
        Ok(Self {
            stream,
            buffer: VecDeque::new(),
            next_ack_id: 1,
        })
    }

    /// Send a raw text frame.
    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<(), anyhow::Error> {
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Send a request and wait for its ack. Returns the ack's `data`.
    pub async fn request(&mut self, event: &str, data: Value) -> Result<Value, anyhow::Error> {
        let ack_id = self.next_ack_id;
        self.next_ack_id += 1;

        let frame = json!({ "event": event, "data": data, "ackId": ack_id });
        self.send_text(frame.to_string()).await?;
        self.expect_ack(ack_id).await
    }

    /// Send a request whose `data` is given as raw JSON text, keeping its
    /// exact bytes on the wire.
    pub async fn request_raw(&mut self, event: &str, data: &str) -> Result<Value, anyhow::Error> {
        let ack_id = self.next_ack_id;
        self.next_ack_id += 1;

        let frame = format!(r#"{{"event":"{event}","data":{data},"ackId":{ack_id}}}"#);
        self.send_text(frame).await?;
        self.expect_ack(ack_id).await
    }

    /// Wait for the ack carrying `ack_id`.
    pub async fn expect_ack(&mut self, ack_id: u64) -> Result<Value, anyhow::Error> {
        let frame = self
            .expect_matching(|f| f.event == "ack" && f.data["ackId"] == ack_id)
            .await?;
        Ok(frame.data)
    }

    /// Wait for the next event named `event`, leaving others buffered.
    pub async fn expect_event(&mut self, event: &str) -> Result<ServerFrame, anyhow::Error> {
        self.expect_matching(|f| f.event == event).await
    }

    /// Assert that no `event` arrives within `wait`.
    pub async fn expect_no_event(
        &mut self,
        event: &str,
        wait: Duration,
    ) -> Result<(), anyhow::Error> {
        if self.buffer.iter().any(|f| f.event == event) {
            anyhow::bail!("unexpected buffered {event}");
        }

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            match timeout(remaining, self.read_frame()).await {
                Err(_) => return Ok(()),
                Ok(Ok(Some(frame))) if frame.event == event => {
                    anyhow::bail!("unexpected {event}: {}", frame.raw)
                }
                Ok(Ok(Some(frame))) => self.buffer.push_back(frame),
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    /// Every buffered event name, in arrival order.
    pub fn buffered_events(&self) -> Vec<String> {
        self.buffer.iter().map(|f| f.event.clone()).collect()
    }

    /// Wait until the server closes the connection.
    pub async fn expect_closed(&mut self) -> Result<(), anyhow::Error> {
        timeout(DEFAULT_TIMEOUT, async {
            loop {
                match self.stream.next().await {
                    None | Some(Ok(Message::Close(_))) | Some(Err(_)) => return,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("connection was not closed"))
    }

    /// Close the connection from the client side.
    pub async fn close(mut self) -> Result<(), anyhow::Error> {
        self.stream.close(None).await?;
        Ok(())
    }

    async fn expect_matching(
        &mut self,
        matches: impl Fn(&ServerFrame) -> bool,
    ) -> Result<ServerFrame, anyhow::Error> {
        if let Some(pos) = self.buffer.iter().position(&matches) {
            if let Some(frame) = self.buffer.remove(pos) {
                return Ok(frame);
            }
        }

        let deadline = tokio::time::Instant::now() + DEFAULT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let frame = timeout(remaining, self.read_frame())
                .await
                .map_err(|_| {
                    anyhow::anyhow!(
                        "timed out waiting for frame; buffered: {:?}",
                        self.buffered_events()
                    )
                })??
                .ok_or_else(|| anyhow::anyhow!("connection closed while waiting for frame"))?;

            if matches(&frame) {
                return Ok(frame);
            }
            self.buffer.push_back(frame);
        }
    }

    /// Next text frame, skipping control frames. `None` once closed.
    async fn read_frame(&mut self) -> Result<Option<ServerFrame>, anyhow::Error> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    let mut value: Value = serde_json::from_str(&text)?;
                    let event = value["event"]
                        .as_str()
                        .ok_or_else(|| anyhow::anyhow!("frame without event: {text}"))?
                        .to_string();
                    let data = value["data"].take();
                    return Ok(Some(ServerFrame {
                        event,
                        data,
                        raw: text,
                    }));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}
