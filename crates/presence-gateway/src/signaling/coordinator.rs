//! Call table and request routing.
//!
//! The coordinator resolves call ids to their actors and enforces the rules
//! that span calls: a user is in at most one ringing or connected call as
//! caller or answering callee, and ids of recently ended calls are remembered
//! so late requests get `InvalidStateTransition` rather than `CallNotFound`.

use super::call::{CallActor, CallHandle};
use super::{CallKind, CallParticipants, CallState, CallSummary};
use crate::errors::GatewayError;
use crate::index::TopicIndex;
use crate::observability::metrics;
use crate::protocol::{MediaType, ServerEvent, SignalKind};
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::topic::Topic;
use chrono::Utc;
use common::types::{CallId, ConnectionId};
use serde_json::value::RawValue;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Reason sent with `call:rejected` when the callee gives none.
pub const DEFAULT_REJECT_REASON: &str = "User declined the call";

struct CallEntry {
    handle: CallHandle,
    participants: CallParticipants,
    caller_connection: ConnectionId,
    /// Set once the callee accepts.
    callee_connection: Option<ConnectionId>,
}

struct CallTable {
    live: HashMap<CallId, CallEntry>,
    /// User id to the call that makes them unavailable.
    busy: HashMap<String, CallId>,
    ended: VecDeque<CallId>,
    ended_ids: HashSet<CallId>,
    retention: usize,
}

impl CallTable {
    fn new(retention: usize) -> Self {
        Self {
            live: HashMap::new(),
            busy: HashMap::new(),
            ended: VecDeque::new(),
            ended_ids: HashSet::new(),
            retention,
        }
    }

    fn resolve(
        &self,
        call_id: CallId,
        action: &'static str,
    ) -> Result<(CallHandle, CallParticipants), GatewayError> {
        if let Some(entry) = self.live.get(&call_id) {
            return Ok((entry.handle.clone(), entry.participants.clone()));
        }
        if self.ended_ids.contains(&call_id) {
            return Err(GatewayError::InvalidStateTransition {
                call_id,
                from: CallState::Ended,
                action,
            });
        }
        Err(GatewayError::CallNotFound(call_id))
    }

    /// Drop a call that reached `Ended` and remember its id.
    fn finish(&mut self, call_id: CallId) {
        let Some(entry) = self.live.remove(&call_id) else {
            return;
        };

        for user_id in [&entry.participants.caller_id, &entry.participants.callee_id] {
            if self.busy.get(user_id) == Some(&call_id) {
                self.busy.remove(user_id);
            }
        }

        if self.retention > 0 {
            self.ended.push_back(call_id);
            self.ended_ids.insert(call_id);
            while self.ended.len() > self.retention {
                if let Some(evicted) = self.ended.pop_front() {
                    self.ended_ids.remove(&evicted);
                }
            }
        }

        metrics::set_calls_active(self.live.len());
    }
}

/// Owns every live call of one gateway instance.
pub struct CallCoordinator {
    index: Arc<TopicIndex>,
    registry: Arc<ConnectionRegistry>,
    table: Mutex<CallTable>,
    /// Parent of every call actor's token.
    cancel_token: CancellationToken,
}

impl CallCoordinator {
    #[must_use]
    pub fn new(
        index: Arc<TopicIndex>,
        registry: Arc<ConnectionRegistry>,
        ended_call_retention: usize,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            index,
            registry,
            table: Mutex::new(CallTable::new(ended_call_retention)),
            cancel_token,
        }
    }

    /// Start ringing `callee_id`. Returns the new call id.
    #[instrument(skip_all, name = "gw.call.initiate", fields(caller = %caller.user_id()))]
    pub async fn initiate(
        &self,
        caller: &ConnectionHandle,
        callee_id: String,
        kind: CallKind,
        caller_name: Option<String>,
    ) -> Result<CallId, GatewayError> {
        let caller_id = caller.user_id().to_string();
        if callee_id.trim().is_empty() {
            return Err(GatewayError::InvalidMessage(
                "targetUserId must not be empty".to_string(),
            ));
        }
        if callee_id == caller_id {
            return Err(GatewayError::InvalidMessage(
                "cannot call yourself".to_string(),
            ));
        }

        let call_id = CallId::new();
        {
            let mut table = self.table.lock().await;
            if let Some(existing) = table.busy.get(&caller_id) {
                return Err(GatewayError::AlreadyInCall {
                    user_id: caller_id,
                    call_id: *existing,
                });
            }

            let participants = CallParticipants {
                caller_id: caller_id.clone(),
                callee_id: callee_id.clone(),
            };
            let (handle, _task) = CallActor::spawn(
                call_id,
                participants.clone(),
                kind,
                caller.clone(),
                Arc::clone(&self.index),
                self.cancel_token.child_token(),
            );

            table.live.insert(
                call_id,
                CallEntry {
                    handle,
                    participants,
                    caller_connection: caller.connection_id(),
                    callee_connection: None,
                },
            );
            table.busy.insert(caller_id.clone(), call_id);
            metrics::set_calls_active(table.live.len());
        }

        let event = ServerEvent::CallIncoming {
            call_id,
            caller_id: caller_id.clone(),
            caller_name,
            call_type: kind,
            timestamp: Utc::now(),
        };
        let delivered = self
            .index
            .broadcast(&Topic::user(callee_id.clone()), Arc::new(event), None)
            .await;

        info!(
            target: "gw.call",
            call_id = %call_id,
            caller_id = %caller_id,
            callee_id = %callee_id,
            kind = ?kind,
            delivered,
            "Call initiated"
        );
        Ok(call_id)
    }

    /// Answer a ringing call from `callee`'s connection.
    ///
    /// `claimed_caller` is the caller id the client believes it is answering;
    /// a mismatch is rejected.
    #[instrument(skip_all, name = "gw.call.accept", fields(call_id = %call_id))]
    pub async fn accept(
        &self,
        call_id: CallId,
        callee: &ConnectionHandle,
        claimed_caller: Option<&str>,
    ) -> Result<(), GatewayError> {
        let user_id = callee.user_id().to_string();
        let (handle, reserved) = {
            let mut table = self.table.lock().await;
            let (handle, participants) = table.resolve(call_id, "accept")?;
            check_claimed_caller(call_id, &participants, claimed_caller)?;

            let mut reserved = false;
            if participants.callee_id == user_id {
                match table.busy.get(&user_id) {
                    Some(other) if *other != call_id => {
                        return Err(GatewayError::AlreadyInCall {
                            user_id,
                            call_id: *other,
                        });
                    }
                    Some(_) => {}
                    None => {
                        table.busy.insert(user_id.clone(), call_id);
                        reserved = true;
                    }
                }
            }
            (handle, reserved)
        };

        let result = handle.accept(callee.clone()).await;

        {
            let mut table = self.table.lock().await;
            match &result {
                Ok(()) => {
                    if let Some(entry) = table.live.get_mut(&call_id) {
                        entry.callee_connection = Some(callee.connection_id());
                    }
                }
                Err(_) if reserved => {
                    if table.busy.get(&user_id) == Some(&call_id) {
                        table.busy.remove(&user_id);
                    }
                }
                Err(_) => {}
            }
        }
        result?;

        // The callee may have dropped while the accept was in flight, after
        // disconnect cleanup already looked for its calls.
        if callee.is_closed() {
            debug!(
                target: "gw.call",
                call_id = %call_id,
                "Callee connection closed during accept, ending call"
            );
            if let Err(e) = self.end(call_id, &user_id).await {
                debug!(
                    target: "gw.call",
                    call_id = %call_id,
                    error = %e,
                    "Call already ended before accept cleanup"
                );
            }
        }
        Ok(())
    }

    /// Decline a ringing call.
    #[instrument(skip_all, name = "gw.call.reject", fields(call_id = %call_id))]
    pub async fn reject(
        &self,
        call_id: CallId,
        callee_id: &str,
        claimed_caller: Option<&str>,
        reason: Option<String>,
    ) -> Result<CallSummary, GatewayError> {
        let handle = {
            let table = self.table.lock().await;
            let (handle, participants) = table.resolve(call_id, "reject")?;
            check_claimed_caller(call_id, &participants, claimed_caller)?;
            handle
        };

        let reason = reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_REJECT_REASON.to_string());
        let summary = handle.reject(callee_id.to_string(), reason).await?;
        self.table.lock().await.finish(call_id);
        Ok(summary)
    }

    /// Hang up a ringing or connected call.
    #[instrument(skip_all, name = "gw.call.end", fields(call_id = %call_id))]
    pub async fn end(&self, call_id: CallId, requester_id: &str) -> Result<CallSummary, GatewayError> {
        let handle = {
            let table = self.table.lock().await;
            table.resolve(call_id, "end")?.0
        };

        let summary = handle.end(requester_id.to_string()).await?;
        self.table.lock().await.finish(call_id);
        Ok(summary)
    }

    /// Forward a session description or ICE candidate to the other participant.
    pub async fn relay(
        &self,
        call_id: CallId,
        kind: SignalKind,
        from_user_id: &str,
        to_user_id: String,
        payload: Box<RawValue>,
    ) -> Result<(), GatewayError> {
        let handle = {
            let table = self.table.lock().await;
            table.resolve(call_id, "relay")?.0
        };
        handle
            .relay(kind, from_user_id.to_string(), to_user_id, payload)
            .await
    }

    pub async fn toggle_media(
        &self,
        call_id: CallId,
        from: &ConnectionHandle,
        media_type: MediaType,
        enabled: bool,
    ) -> Result<(), GatewayError> {
        let handle = {
            let table = self.table.lock().await;
            table.resolve(call_id, "toggle media")?.0
        };
        handle
            .toggle_media(
                from.user_id().to_string(),
                from.connection_id(),
                media_type,
                enabled,
            )
            .await
    }

    /// End every call the closed connection takes part in.
    ///
    /// Called after the connection has left the registry and every topic. A
    /// ringing call also ends when its callee has no connection left to
    /// answer from.
    #[instrument(skip_all, name = "gw.call.connection_closed", fields(connection_id = %connection.connection_id()))]
    pub async fn connection_closed(&self, connection: &ConnectionHandle) {
        let user_id = connection.user_id();
        let connection_id = connection.connection_id();
        let user_offline = self.registry.for_user(user_id).await.is_empty();

        let affected: Vec<CallId> = {
            let table = self.table.lock().await;
            table
                .live
                .iter()
                .filter(|(_, entry)| {
                    entry.caller_connection == connection_id
                        || entry.callee_connection == Some(connection_id)
                        || (user_offline
                            && entry.callee_connection.is_none()
                            && entry.participants.callee_id == user_id)
                })
                .map(|(call_id, _)| *call_id)
                .collect()
        };

        for call_id in affected {
            match self.end(call_id, user_id).await {
                Ok(_) => info!(
                    target: "gw.call",
                    call_id = %call_id,
                    user_id = %user_id,
                    "Call ended by participant disconnect"
                ),
                Err(e) => debug!(
                    target: "gw.call",
                    call_id = %call_id,
                    error = %e,
                    "Call already ended before disconnect cleanup"
                ),
            }
        }
    }

    /// Recorded participants of a live call.
    pub async fn participants(&self, call_id: CallId) -> Option<CallParticipants> {
        self.table
            .lock()
            .await
            .live
            .get(&call_id)
            .map(|entry| entry.participants.clone())
    }

    /// Current state of a call, `None` if it was never known or has been
    /// forgotten.
    pub async fn state(&self, call_id: CallId) -> Option<CallState> {
        let handle = {
            let table = self.table.lock().await;
            if table.ended_ids.contains(&call_id) {
                return Some(CallState::Ended);
            }
            table.live.get(&call_id).map(|entry| entry.handle.clone())?
        };
        Some(handle.state().await)
    }

    /// The call that currently makes `user_id` busy, if any.
    pub async fn active_call_for(&self, user_id: &str) -> Option<CallId> {
        self.table.lock().await.busy.get(user_id).copied()
    }

    pub async fn live_count(&self) -> usize {
        self.table.lock().await.live.len()
    }

    /// Stop every call actor.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

fn check_claimed_caller(
    call_id: CallId,
    participants: &CallParticipants,
    claimed_caller: Option<&str>,
) -> Result<(), GatewayError> {
    match claimed_caller {
        Some(claimed) if claimed != participants.caller_id => Err(GatewayError::NotAParticipant {
            call_id,
            user_id: claimed.to_string(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::registry::Outbound;
    use tokio::sync::mpsc;

    struct Harness {
        index: Arc<TopicIndex>,
        registry: Arc<ConnectionRegistry>,
        coordinator: CallCoordinator,
    }

    impl Harness {
        fn new(retention: usize) -> Self {
            let index = Arc::new(TopicIndex::new());
            let registry = Arc::new(ConnectionRegistry::new());
            let coordinator = CallCoordinator::new(
                Arc::clone(&index),
                Arc::clone(&registry),
                retention,
                CancellationToken::new(),
            );
            Self {
                index,
                registry,
                coordinator,
            }
        }

        async fn connect(&self, user_id: &str) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
            let identity = Identity::new(user_id, None, None).unwrap();
            let (handle, rx) =
                ConnectionHandle::new(ConnectionId::new(), identity, 32, CancellationToken::new());
            self.registry.insert(handle.clone()).await;
            self.index.join(&handle, Topic::user(user_id)).await;
            (handle, rx)
        }

        async fn disconnect(&self, handle: &ConnectionHandle) {
            handle.close();
            self.registry.remove(handle.connection_id()).await;
            self.index.leave_all(handle.connection_id()).await;
            self.coordinator.connection_closed(handle).await;
        }
    }

    fn names(rx: &mut mpsc::Receiver<Outbound>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        names
    }

    #[tokio::test]
    async fn test_initiate_accept_end() {
        let h = Harness::new(16);
        let (caller, mut caller_rx) = h.connect("u1").await;
        let (callee, mut callee_rx) = h.connect("u2").await;

        let call_id = h
            .coordinator
            .initiate(&caller, "u2".to_string(), CallKind::Audio, Some("Ada".to_string()))
            .await
            .unwrap();
        assert_eq!(names(&mut callee_rx), vec!["call:incoming"]);
        assert_eq!(h.coordinator.state(call_id).await, Some(CallState::Ringing));
        assert!(h.index.members(&Topic::Call(call_id)).await.is_empty());

        h.coordinator
            .accept(call_id, &callee, Some("u1"))
            .await
            .unwrap();
        assert_eq!(names(&mut caller_rx), vec!["call:accepted"]);
        assert_eq!(h.index.members(&Topic::Call(call_id)).await.len(), 2);
        assert_eq!(h.coordinator.active_call_for("u2").await, Some(call_id));

        let summary = h.coordinator.end(call_id, "u1").await.unwrap();
        assert_eq!(
            summary.history,
            vec![
                CallState::Idle,
                CallState::Ringing,
                CallState::Connected,
                CallState::Ended
            ]
        );
        assert_eq!(summary.ended_by, "u1");
        assert_eq!(h.coordinator.live_count().await, 0);
        assert_eq!(h.coordinator.active_call_for("u1").await, None);
        assert_eq!(h.coordinator.active_call_for("u2").await, None);
        assert_eq!(h.index.topic_count().await, 2, "call topic removed");

        let err = h
            .coordinator
            .accept(call_id, &callee, None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "InvalidStateTransition");
        assert_eq!(h.coordinator.state(call_id).await, Some(CallState::Ended));
    }

    #[tokio::test]
    async fn test_unknown_call_is_not_found() {
        let h = Harness::new(16);
        let err = h.coordinator.end(CallId::new(), "u1").await.unwrap_err();
        assert_eq!(err.error_code(), "CallNotFound");
    }

    #[tokio::test]
    async fn test_busy_caller_cannot_initiate() {
        let h = Harness::new(16);
        let (caller, _rx) = h.connect("u1").await;
        h.connect("u2").await;

        let first = h
            .coordinator
            .initiate(&caller, "u2".to_string(), CallKind::Video, None)
            .await
            .unwrap();
        let err = h
            .coordinator
            .initiate(&caller, "u3".to_string(), CallKind::Video, None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            GatewayError::AlreadyInCall { call_id, .. } if call_id == first
        ));
    }

    #[tokio::test]
    async fn test_self_call_rejected() {
        let h = Harness::new(16);
        let (caller, _rx) = h.connect("u1").await;
        let err = h
            .coordinator
            .initiate(&caller, "u1".to_string(), CallKind::Audio, None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "InvalidMessage");
    }

    #[tokio::test]
    async fn test_concurrent_incoming_calls_ring_independently() {
        let h = Harness::new(16);
        let (a, mut a_rx) = h.connect("a").await;
        let (b, mut b_rx) = h.connect("b").await;
        let (callee, mut callee_rx) = h.connect("c").await;

        let from_a = h
            .coordinator
            .initiate(&a, "c".to_string(), CallKind::Audio, None)
            .await
            .unwrap();
        let from_b = h
            .coordinator
            .initiate(&b, "c".to_string(), CallKind::Audio, None)
            .await
            .unwrap();
        assert_eq!(names(&mut callee_rx), vec!["call:incoming", "call:incoming"]);

        h.coordinator.accept(from_a, &callee, None).await.unwrap();
        assert_eq!(h.coordinator.state(from_b).await, Some(CallState::Ringing));

        let err = h
            .coordinator
            .accept(from_b, &callee, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::AlreadyInCall { call_id, .. } if call_id == from_a
        ));

        h.coordinator
            .reject(from_b, "c", Some("b"), None)
            .await
            .unwrap();
        assert_eq!(names(&mut a_rx), vec!["call:accepted"]);
        assert_eq!(names(&mut b_rx), vec!["call:rejected"]);
    }

    #[tokio::test]
    async fn test_claimed_caller_mismatch() {
        let h = Harness::new(16);
        let (caller, _rx) = h.connect("u1").await;
        let (callee, _crx) = h.connect("u2").await;
        let call_id = h
            .coordinator
            .initiate(&caller, "u2".to_string(), CallKind::Audio, None)
            .await
            .unwrap();

        let err = h
            .coordinator
            .accept(call_id, &callee, Some("u9"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "NotAParticipant");
        assert_eq!(h.coordinator.active_call_for("u2").await, None);
    }

    #[tokio::test]
    async fn test_callee_disconnect_while_ringing_ends_call() {
        let h = Harness::new(16);
        let (caller, mut caller_rx) = h.connect("u1").await;
        let (callee, _crx) = h.connect("u2").await;
        let call_id = h
            .coordinator
            .initiate(&caller, "u2".to_string(), CallKind::Video, None)
            .await
            .unwrap();

        h.disconnect(&callee).await;

        assert_eq!(names(&mut caller_rx), vec!["call:ended"]);
        assert_eq!(h.coordinator.state(call_id).await, Some(CallState::Ended));
        assert_eq!(h.coordinator.active_call_for("u1").await, None);
    }

    #[tokio::test]
    async fn test_ringing_survives_when_callee_has_another_connection() {
        let h = Harness::new(16);
        let (caller, _rx) = h.connect("u1").await;
        let (phone, _prx) = h.connect("u2").await;
        let (_laptop, _lrx) = h.connect("u2").await;
        let call_id = h
            .coordinator
            .initiate(&caller, "u2".to_string(), CallKind::Video, None)
            .await
            .unwrap();

        h.disconnect(&phone).await;

        assert_eq!(h.coordinator.state(call_id).await, Some(CallState::Ringing));
    }

    #[tokio::test]
    async fn test_connected_participant_disconnect_notifies_peer() {
        let h = Harness::new(16);
        let (caller, mut caller_rx) = h.connect("u1").await;
        let (callee, _crx) = h.connect("u2").await;
        let call_id = h
            .coordinator
            .initiate(&caller, "u2".to_string(), CallKind::Video, None)
            .await
            .unwrap();
        h.coordinator.accept(call_id, &callee, None).await.unwrap();
        names(&mut caller_rx);

        h.disconnect(&callee).await;

        assert_eq!(names(&mut caller_rx), vec!["call:ended"]);
        assert!(h.index.members(&Topic::Call(call_id)).await.is_empty());
    }

    #[tokio::test]
    async fn test_ended_ids_are_bounded() {
        let h = Harness::new(1);
        let (caller, _rx) = h.connect("u1").await;
        h.connect("u2").await;

        let first = h
            .coordinator
            .initiate(&caller, "u2".to_string(), CallKind::Audio, None)
            .await
            .unwrap();
        h.coordinator.end(first, "u1").await.unwrap();

        let second = h
            .coordinator
            .initiate(&caller, "u2".to_string(), CallKind::Audio, None)
            .await
            .unwrap();
        h.coordinator.end(second, "u1").await.unwrap();

        assert_eq!(
            h.coordinator.end(second, "u1").await.unwrap_err().error_code(),
            "InvalidStateTransition"
        );
        assert_eq!(
            h.coordinator.end(first, "u1").await.unwrap_err().error_code(),
            "CallNotFound",
            "oldest tombstone evicted"
        );
    }
}
