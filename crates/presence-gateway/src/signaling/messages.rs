//! Mailbox messages for the call actor.

use super::{CallState, CallSummary};
use crate::errors::GatewayError;
use crate::protocol::{MediaType, SignalKind};
use crate::registry::ConnectionHandle;
use common::types::ConnectionId;
use serde_json::value::RawValue;
use tokio::sync::oneshot;

/// Messages handled by a `CallActor`.
#[derive(Debug)]
pub enum CallMessage {
    /// The callee answers from `connection`.
    Accept {
        connection: ConnectionHandle,
        respond_to: oneshot::Sender<Result<(), GatewayError>>,
    },

    /// The callee declines.
    Reject {
        requester_id: String,
        reason: String,
        respond_to: oneshot::Sender<Result<CallSummary, GatewayError>>,
    },

    /// Either participant hangs up, explicitly or by disconnecting.
    End {
        requester_id: String,
        respond_to: oneshot::Sender<Result<CallSummary, GatewayError>>,
    },

    /// Forward an SDP or ICE payload to the other participant.
    Relay {
        kind: SignalKind,
        from_user_id: String,
        to_user_id: String,
        payload: Box<RawValue>,
        respond_to: oneshot::Sender<Result<(), GatewayError>>,
    },

    ToggleMedia {
        from_user_id: String,
        from_connection: ConnectionId,
        media_type: MediaType,
        enabled: bool,
        respond_to: oneshot::Sender<Result<(), GatewayError>>,
    },

    GetState {
        respond_to: oneshot::Sender<CallState>,
    },
}

impl CallMessage {
    /// Action name used in `InvalidStateTransition` errors.
    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            CallMessage::Accept { .. } => "accept",
            CallMessage::Reject { .. } => "reject",
            CallMessage::End { .. } => "end",
            CallMessage::Relay { .. } => "relay",
            CallMessage::ToggleMedia { .. } => "toggle media",
            CallMessage::GetState { .. } => "get state",
        }
    }
}
