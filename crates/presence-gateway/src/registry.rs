//! Connection registry.
//!
//! Maps live connection ids to their identity and outbound queue. Each
//! connection owns a bounded queue drained by its writer task; delivery never
//! blocks the broadcaster. A connection whose queue is full is disconnected
//! through its cancellation token.

use crate::identity::Identity;
use crate::observability::metrics;
use crate::protocol::ServerEvent;
use chrono::{DateTime, Utc};
use common::types::ConnectionId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outbound message shared across every recipient of a broadcast.
pub type Outbound = Arc<ServerEvent>;

/// Handle to a live connection.
///
/// Cheap to clone; every clone feeds the same outbound queue.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    connection_id: ConnectionId,
    identity: Arc<Identity>,
    connected_at: DateTime<Utc>,
    sender: mpsc::Sender<Outbound>,
    cancel_token: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its outbound queue.
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        identity: Identity,
        queue_capacity: usize,
        cancel_token: CancellationToken,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let handle = Self {
            connection_id,
            identity: Arc::new(identity),
            connected_at: Utc::now(),
            sender,
            cancel_token,
        };
        (handle, receiver)
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    /// Enqueue an event without waiting.
    ///
    /// Returns `false` if the event was dropped. A full queue disconnects the
    /// connection.
    pub fn deliver(&self, event: Outbound) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => {
                metrics::record_message_delivered();
                true
            }
            Err(TrySendError::Full(event)) => {
                warn!(
                    target: "gw.registry",
                    connection_id = %self.connection_id,
                    event = event.name(),
                    "Outbound queue full, disconnecting slow connection"
                );
                metrics::record_message_dropped("queue_full");
                self.cancel_token.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => {
                metrics::record_message_dropped("closed");
                false
            }
        }
    }

    /// Ask the connection's tasks to shut down.
    pub fn close(&self) {
        self.cancel_token.cancel();
    }

    /// Resolves once the connection has been asked to close.
    pub async fn closed(&self) {
        self.cancel_token.cancelled().await;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled() || self.sender.is_closed()
    }
}

/// Read-only view of a connection for listings and the stats endpoint.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub role: Option<crate::identity::Role>,
    pub organization_id: Option<String>,
    pub connected_at: DateTime<Utc>,
}

impl From<&ConnectionHandle> for ConnectionInfo {
    fn from(handle: &ConnectionHandle) -> Self {
        Self {
            connection_id: handle.connection_id,
            user_id: handle.identity.user_id.clone(),
            role: handle.identity.role.clone(),
            organization_id: handle.identity.organization_id.clone(),
            connected_at: handle.connected_at,
        }
    }
}

/// Live connections keyed by id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, handle: ConnectionHandle) {
        let count = {
            let mut connections = self.connections.write().await;
            connections.insert(handle.connection_id, handle.clone());
            connections.len()
        };
        metrics::set_connections_active(count);
        debug!(
            target: "gw.registry",
            connection_id = %handle.connection_id,
            user_id = %handle.user_id(),
            active = count,
            "Connection registered"
        );
    }

    /// Remove a connection. Idempotent; returns the handle if it was present.
    pub async fn remove(&self, connection_id: ConnectionId) -> Option<ConnectionHandle> {
        let (removed, count) = {
            let mut connections = self.connections.write().await;
            let removed = connections.remove(&connection_id);
            (removed, connections.len())
        };

        if removed.is_some() {
            metrics::set_connections_active(count);
            debug!(
                target: "gw.registry",
                connection_id = %connection_id,
                active = count,
                "Connection unregistered"
            );
        }
        removed
    }

    pub async fn lookup(&self, connection_id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.read().await.get(&connection_id).cloned()
    }

    pub async fn all(&self) -> Vec<ConnectionHandle> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn for_user(&self, user_id: &str) -> Vec<ConnectionHandle> {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.identity.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn for_role(&self, role: &str) -> Vec<ConnectionHandle> {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.identity.role.as_ref().is_some_and(|r| r.as_str() == role))
            .cloned()
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::identity::Role;

    fn handle(user_id: &str, role: Option<Role>, capacity: usize) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        let identity = Identity::new(user_id, role, None).unwrap();
        ConnectionHandle::new(ConnectionId::new(), identity, capacity, CancellationToken::new())
    }

    fn ping_event() -> Outbound {
        Arc::new(ServerEvent::DashboardUpdate(serde_json::json!({"beds": 4})))
    }

    #[tokio::test]
    async fn test_insert_lookup_remove() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = handle("u1", Some(Role::Patient), 4);
        let id = conn.connection_id();

        registry.insert(conn).await;
        assert_eq!(registry.count().await, 1);
        assert_eq!(registry.lookup(id).await.unwrap().user_id(), "u1");

        assert!(registry.remove(id).await.is_some());
        assert!(registry.remove(id).await.is_none(), "remove is idempotent");
        assert!(registry.lookup(id).await.is_none());
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_queries_by_user_and_role() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = handle("u1", Some(Role::Provider), 4);
        let (b, _rb) = handle("u1", Some(Role::Provider), 4);
        let (c, _rc) = handle("u2", Some(Role::Admin), 4);
        registry.insert(a).await;
        registry.insert(b).await;
        registry.insert(c).await;

        assert_eq!(registry.for_user("u1").await.len(), 2);
        assert_eq!(registry.for_user("u3").await.len(), 0);
        assert_eq!(registry.for_role("admin").await.len(), 1);
        assert_eq!(registry.for_role("provider").await.len(), 2);
        assert_eq!(registry.all().await.len(), 3);
    }

    #[tokio::test]
    async fn test_deliver_enqueues() {
        let (conn, mut rx) = handle("u1", None, 4);
        assert!(conn.deliver(ping_event()));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.name(), "dashboard:update");
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_full_queue_disconnects_connection() {
        let (conn, _rx) = handle("u1", None, 1);
        assert!(conn.deliver(ping_event()));
        assert!(!conn.deliver(ping_event()), "second event overflows");
        assert!(conn.is_closed(), "overflow cancels the connection");
    }

    #[tokio::test]
    async fn test_deliver_after_receiver_dropped() {
        let (conn, rx) = handle("u1", None, 4);
        drop(rx);
        assert!(!conn.deliver(ping_event()));
        assert!(conn.is_closed());
    }

    #[test]
    fn test_connection_info_serializes_camel_case() {
        let (conn, _rx) = handle("u1", Some(Role::Patient), 1);
        let value = serde_json::to_value(ConnectionInfo::from(&conn)).unwrap();
        assert_eq!(value["userId"], "u1");
        assert_eq!(value["role"], "patient");
        assert!(value.get("connectedAt").is_some());
    }
}
