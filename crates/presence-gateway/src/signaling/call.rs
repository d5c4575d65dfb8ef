//! `CallActor` - one task per call.
//!
//! The actor is the single writer of its call's state. Requests arrive
//! through the mailbox and are applied one at a time, so of two racing
//! terminal requests the second always observes `Ended`.
//!
//! # Lifecycle
//!
//! 1. Spawned by the coordinator on initiate, already `Ringing`
//! 2. Runs until the call ends or its cancellation token fires
//! 3. Messages still queued at exit are refused with `InvalidStateTransition`

use super::messages::CallMessage;
use super::{CallKind, CallParticipants, CallState, CallSummary};
use crate::errors::GatewayError;
use crate::index::TopicIndex;
use crate::observability::metrics;
use crate::protocol::{MediaType, ServerEvent, SignalKind};
use crate::registry::ConnectionHandle;
use crate::topic::Topic;
use chrono::Utc;
use common::types::{CallId, ConnectionId};
use serde_json::value::RawValue;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Mailbox size for a call. Calls see a handful of messages per second at most.
const CALL_CHANNEL_BUFFER: usize = 64;

/// Handle to a `CallActor`.
#[derive(Clone, Debug)]
pub struct CallHandle {
    sender: mpsc::Sender<CallMessage>,
    call_id: CallId,
}

impl CallHandle {
    #[must_use]
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// A closed mailbox means the actor already ended the call.
    fn ended(&self, action: &'static str) -> GatewayError {
        GatewayError::InvalidStateTransition {
            call_id: self.call_id,
            from: CallState::Ended,
            action,
        }
    }

    async fn request<T>(
        &self,
        action: &'static str,
        message: CallMessage,
        rx: oneshot::Receiver<Result<T, GatewayError>>,
    ) -> Result<T, GatewayError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| self.ended(action))?;

        rx.await.map_err(|_| self.ended(action))?
    }

    pub async fn accept(&self, connection: ConnectionHandle) -> Result<(), GatewayError> {
        let (tx, rx) = oneshot::channel();
        let message = CallMessage::Accept {
            connection,
            respond_to: tx,
        };
        self.request("accept", message, rx).await
    }

    pub async fn reject(
        &self,
        requester_id: String,
        reason: String,
    ) -> Result<CallSummary, GatewayError> {
        let (tx, rx) = oneshot::channel();
        let message = CallMessage::Reject {
            requester_id,
            reason,
            respond_to: tx,
        };
        self.request("reject", message, rx).await
    }

    pub async fn end(&self, requester_id: String) -> Result<CallSummary, GatewayError> {
        let (tx, rx) = oneshot::channel();
        let message = CallMessage::End {
            requester_id,
            respond_to: tx,
        };
        self.request("end", message, rx).await
    }

    pub async fn relay(
        &self,
        kind: SignalKind,
        from_user_id: String,
        to_user_id: String,
        payload: Box<RawValue>,
    ) -> Result<(), GatewayError> {
        let (tx, rx) = oneshot::channel();
        let message = CallMessage::Relay {
            kind,
            from_user_id,
            to_user_id,
            payload,
            respond_to: tx,
        };
        self.request("relay", message, rx).await
    }

    pub async fn toggle_media(
        &self,
        from_user_id: String,
        from_connection: ConnectionId,
        media_type: MediaType,
        enabled: bool,
    ) -> Result<(), GatewayError> {
        let (tx, rx) = oneshot::channel();
        let message = CallMessage::ToggleMedia {
            from_user_id,
            from_connection,
            media_type,
            enabled,
            respond_to: tx,
        };
        self.request("toggle media", message, rx).await
    }

    /// Current state. A call whose actor has exited reports `Ended`.
    pub async fn state(&self) -> CallState {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(CallMessage::GetState { respond_to: tx })
            .await
            .is_err()
        {
            return CallState::Ended;
        }
        rx.await.unwrap_or(CallState::Ended)
    }
}

/// The `CallActor` implementation.
pub struct CallActor {
    call_id: CallId,
    participants: CallParticipants,
    kind: CallKind,
    state: CallState,
    history: Vec<CallState>,
    /// Connection the caller initiated from; joins the call topic on accept.
    caller_connection: ConnectionHandle,
    index: Arc<TopicIndex>,
    receiver: mpsc::Receiver<CallMessage>,
    cancel_token: CancellationToken,
}

impl CallActor {
    /// Spawn a ringing call.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        call_id: CallId,
        participants: CallParticipants,
        kind: CallKind,
        caller_connection: ConnectionHandle,
        index: Arc<TopicIndex>,
        cancel_token: CancellationToken,
    ) -> (CallHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CALL_CHANNEL_BUFFER);

        metrics::record_call_transition(CallState::Ringing.as_str());
        let actor = Self {
            call_id,
            participants,
            kind,
            state: CallState::Ringing,
            history: vec![CallState::Idle, CallState::Ringing],
            caller_connection,
            index,
            receiver,
            cancel_token,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = CallHandle { sender, call_id };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "gw.call.actor", fields(call_id = %self.call_id))]
    async fn run(mut self) {
        debug!(
            target: "gw.call",
            call_id = %self.call_id,
            kind = ?self.kind,
            "CallActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "gw.call",
                        call_id = %self.call_id,
                        "CallActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message).await;
                            if self.state == CallState::Ended {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // Anything still queued lost the race against a terminal transition.
        self.receiver.close();
        while let Ok(message) = self.receiver.try_recv() {
            self.refuse(message);
        }

        debug!(
            target: "gw.call",
            call_id = %self.call_id,
            state = self.state.as_str(),
            "CallActor stopped"
        );
    }

    async fn handle_message(&mut self, message: CallMessage) {
        match message {
            CallMessage::Accept {
                connection,
                respond_to,
            } => {
                let result = self.handle_accept(connection).await;
                let _ = respond_to.send(result);
            }
            CallMessage::Reject {
                requester_id,
                reason,
                respond_to,
            } => {
                let result = self.handle_reject(requester_id, reason).await;
                let _ = respond_to.send(result);
            }
            CallMessage::End {
                requester_id,
                respond_to,
            } => {
                let result = self.handle_end(requester_id).await;
                let _ = respond_to.send(result);
            }
            CallMessage::Relay {
                kind,
                from_user_id,
                to_user_id,
                payload,
                respond_to,
            } => {
                let result = self
                    .handle_relay(kind, from_user_id, to_user_id, payload)
                    .await;
                let _ = respond_to.send(result);
            }
            CallMessage::ToggleMedia {
                from_user_id,
                from_connection,
                media_type,
                enabled,
                respond_to,
            } => {
                let result = self
                    .handle_toggle_media(from_user_id, from_connection, media_type, enabled)
                    .await;
                let _ = respond_to.send(result);
            }
            CallMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state);
            }
        }
    }

    fn refuse(&self, message: CallMessage) {
        let action = message.action();
        let err = || self.invalid(action);
        match message {
            CallMessage::Accept { respond_to, .. }
            | CallMessage::Relay { respond_to, .. }
            | CallMessage::ToggleMedia { respond_to, .. } => {
                let _ = respond_to.send(Err(err()));
            }
            CallMessage::Reject { respond_to, .. } | CallMessage::End { respond_to, .. } => {
                let _ = respond_to.send(Err(err()));
            }
            CallMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state);
            }
        }
    }

    fn invalid(&self, action: &'static str) -> GatewayError {
        GatewayError::InvalidStateTransition {
            call_id: self.call_id,
            from: self.state,
            action,
        }
    }

    fn not_a_participant(&self, user_id: String) -> GatewayError {
        GatewayError::NotAParticipant {
            call_id: self.call_id,
            user_id,
        }
    }

    fn transition(&mut self, to: CallState) {
        info!(
            target: "gw.call",
            call_id = %self.call_id,
            from = self.state.as_str(),
            to = to.as_str(),
            "Call state transition"
        );
        self.state = to;
        self.history.push(to);
        metrics::record_call_transition(to.as_str());
    }

    fn summary(&self, ended_by: String) -> CallSummary {
        CallSummary {
            call_id: self.call_id,
            participants: self.participants.clone(),
            kind: self.kind,
            ended_by,
            history: self.history.clone(),
        }
    }

    async fn handle_accept(&mut self, connection: ConnectionHandle) -> Result<(), GatewayError> {
        if connection.user_id() != self.participants.callee_id {
            return Err(self.not_a_participant(connection.user_id().to_string()));
        }
        if self.state != CallState::Ringing {
            return Err(self.invalid("accept"));
        }

        let topic = Topic::Call(self.call_id);
        self.index.join(&self.caller_connection, topic.clone()).await;
        self.index.join(&connection, topic).await;
        self.transition(CallState::Connected);

        let event = ServerEvent::CallAccepted {
            call_id: self.call_id,
            accepted_by: self.participants.callee_id.clone(),
            timestamp: Utc::now(),
        };
        self.index
            .broadcast(
                &Topic::user(self.participants.caller_id.clone()),
                Arc::new(event),
                None,
            )
            .await;
        Ok(())
    }

    async fn handle_reject(
        &mut self,
        requester_id: String,
        reason: String,
    ) -> Result<CallSummary, GatewayError> {
        if requester_id != self.participants.callee_id {
            return Err(self.not_a_participant(requester_id));
        }
        if self.state != CallState::Ringing {
            return Err(self.invalid("reject"));
        }

        self.transition(CallState::Ended);

        let event = ServerEvent::CallRejected {
            call_id: self.call_id,
            rejected_by: requester_id.clone(),
            reason,
            timestamp: Utc::now(),
        };
        self.index
            .broadcast(
                &Topic::user(self.participants.caller_id.clone()),
                Arc::new(event),
                None,
            )
            .await;
        self.index.remove_topic(&Topic::Call(self.call_id)).await;

        Ok(self.summary(requester_id))
    }

    async fn handle_end(&mut self, requester_id: String) -> Result<CallSummary, GatewayError> {
        if !self.participants.contains(&requester_id) {
            return Err(self.not_a_participant(requester_id));
        }
        if !self.state.is_active() {
            return Err(self.invalid("end"));
        }

        let was_connected = self.state == CallState::Connected;
        self.transition(CallState::Ended);

        let event = Arc::new(ServerEvent::CallEnded {
            call_id: self.call_id,
            ended_by: requester_id.clone(),
            timestamp: Utc::now(),
        });

        if was_connected {
            let topic = Topic::Call(self.call_id);
            self.index.broadcast(&topic, event, None).await;
            self.index.remove_topic(&topic).await;
        } else {
            // No call topic exists while ringing; reach both users directly.
            let topics = [
                Topic::user(self.participants.caller_id.clone()),
                Topic::user(self.participants.callee_id.clone()),
            ];
            self.index.broadcast_many(&topics, event).await;
            self.index.remove_topic(&Topic::Call(self.call_id)).await;
        }

        Ok(self.summary(requester_id))
    }

    async fn handle_relay(
        &mut self,
        kind: SignalKind,
        from_user_id: String,
        to_user_id: String,
        payload: Box<RawValue>,
    ) -> Result<(), GatewayError> {
        if !self.participants.contains(&from_user_id) {
            return Err(self.not_a_participant(from_user_id));
        }
        if !self.participants.is_pair(&from_user_id, &to_user_id) {
            return Err(self.not_a_participant(to_user_id));
        }
        if !self.state.is_active() {
            return Err(self.invalid("relay"));
        }

        let size = payload.get().len();
        let event = ServerEvent::relay(kind, self.call_id, from_user_id, payload);
        let delivered = self
            .index
            .broadcast(&Topic::user(to_user_id), Arc::new(event), None)
            .await;

        debug!(
            target: "gw.call",
            call_id = %self.call_id,
            event = kind.event_name(),
            bytes = size,
            delivered,
            "Relayed signaling payload"
        );
        Ok(())
    }

    async fn handle_toggle_media(
        &mut self,
        from_user_id: String,
        from_connection: ConnectionId,
        media_type: MediaType,
        enabled: bool,
    ) -> Result<(), GatewayError> {
        if !self.participants.contains(&from_user_id) {
            return Err(self.not_a_participant(from_user_id));
        }
        if self.state != CallState::Connected {
            return Err(self.invalid("toggle media"));
        }

        let event = ServerEvent::CallMediaToggled {
            call_id: self.call_id,
            user_id: from_user_id,
            media_type,
            enabled,
        };
        self.index
            .broadcast(
                &Topic::Call(self.call_id),
                Arc::new(event),
                Some(from_connection),
            )
            .await;
        Ok(())
    }
}
