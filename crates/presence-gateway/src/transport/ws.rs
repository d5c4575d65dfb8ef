//! WebSocket connection handling.
//!
//! # Lifecycle
//!
//! 1. The handshake identity claim is read from the query string and the
//!    connection is admitted before the upgrade; a claim without a user id is
//!    refused with 401 and never upgraded
//! 2. A writer task drains the outbound queue and sends keepalive pings
//! 3. The reader loop answers every request frame with an `ack`
//! 4. On close, error or slow-consumer disconnect the connection is removed
//!    from the gateway, which ends any call it takes part in

use crate::gateway::Gateway;
use crate::identity::IdentityClaim;
use crate::observability::metrics;
use crate::protocol::{Ack, AckBody, RawFrame, ServerEvent};
use crate::registry::{ConnectionHandle, Outbound};
use crate::routes::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use common::types::ConnectionId;
use futures::{Sink, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

/// `GET /live` upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(claim): Query<IdentityClaim>,
) -> Response {
    let connection_id = ConnectionId::new();

    let (connection, outbound) = match state.gateway.admit(connection_id, claim).await {
        Ok(admitted) => admitted,
        Err(e) => {
            warn!(
                target: "gw.ws",
                connection_id = %connection_id,
                error = %e,
                "Handshake rejected"
            );
            return e.into_response();
        }
    };

    let keepalive = state.config.keepalive_interval;
    let gateway = Arc::clone(&state.gateway);
    let cleanup = Arc::clone(&state.gateway);

    ws.on_failed_upgrade(move |e| {
        warn!(
            target: "gw.ws",
            connection_id = %connection_id,
            error = %e,
            "WebSocket upgrade failed"
        );
        tokio::spawn(async move {
            cleanup.remove(connection_id).await;
        });
    })
    .on_upgrade(move |socket| run_connection(socket, gateway, connection, outbound, keepalive))
}

#[instrument(skip_all, name = "gw.ws.connection", fields(connection_id = %connection.connection_id()))]
async fn run_connection(
    socket: WebSocket,
    gateway: Arc<Gateway>,
    connection: ConnectionHandle,
    outbound: mpsc::Receiver<Outbound>,
    keepalive: Duration,
) {
    let connection_id = connection.connection_id();
    info!(
        target: "gw.ws",
        connection_id = %connection_id,
        user_id = %connection.user_id(),
        "Client connected"
    );

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, outbound, connection.clone(), keepalive));

    loop {
        tokio::select! {
            () = connection.closed() => {
                debug!(target: "gw.ws", connection_id = %connection_id, "Connection closed by gateway");
                break;
            }

            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&gateway, &connection, &text).await;
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => handle_frame(&gateway, &connection, &text).await,
                        Err(_) => {
                            metrics::record_request("invalid", "InvalidMessage", Duration::ZERO);
                            send_ack(&connection, None, AckBody::Error { error: "InvalidMessage" });
                        }
                    },
                    // Pings are answered by the protocol layer.
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(target: "gw.ws", connection_id = %connection_id, error = %e, "WebSocket read error");
                        break;
                    }
                }
            }
        }
    }

    connection.close();
    gateway.remove(connection_id).await;
    if let Err(e) = writer.await {
        error!(target: "gw.ws", connection_id = %connection_id, error = %e, "Writer task failed");
    }

    info!(target: "gw.ws", connection_id = %connection_id, "Client disconnected");
}

/// Parse one frame, dispatch it and queue the ack.
async fn handle_frame(gateway: &Gateway, connection: &ConnectionHandle, text: &str) {
    let start = Instant::now();

    let frame = match RawFrame::from_text(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(
                target: "gw.ws",
                connection_id = %connection.connection_id(),
                bytes = text.len(),
                "Malformed frame"
            );
            metrics::record_request("invalid", e.error_code(), start.elapsed());
            send_ack(connection, None, AckBody::error(&e));
            return;
        }
    };

    let body = match frame.request() {
        Ok(request) => gateway.handle_request(connection, request).await,
        Err(e) => {
            debug!(
                target: "gw.ws",
                connection_id = %connection.connection_id(),
                event = %frame.event,
                error = %e,
                "Unparseable request"
            );
            metrics::record_request("invalid", e.error_code(), start.elapsed());
            AckBody::error(&e)
        }
    };

    send_ack(connection, frame.ack_id, body);
}

fn send_ack(connection: &ConnectionHandle, ack_id: Option<u64>, body: AckBody) {
    connection.deliver(Arc::new(ServerEvent::Ack(Ack { ack_id, body })));
}

async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Outbound>,
    connection: ConnectionHandle,
    keepalive: Duration,
) where
    S: Sink<Message> + Unpin,
{
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + keepalive, keepalive);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = connection.closed() => break,

            event = outbound.recv() => {
                let Some(event) = event else { break };
                let frame = match event.to_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(target: "gw.ws", event = event.name(), error = %e, "Failed to encode event");
                        continue;
                    }
                };
                if sink.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }

            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    connection.close();
}
