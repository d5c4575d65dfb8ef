//! Call signaling.
//!
//! Each call is owned by its own [`call::CallActor`] task, so concurrent
//! accept/reject/end requests serialize through one mailbox and exactly one
//! of them wins. The [`coordinator::CallCoordinator`] keeps the table of live
//! calls, the per-user busy set and a bounded memory of recently ended calls.
//!
//! ```text
//! Idle ──initiate──▶ Ringing ──accept──▶ Connected ──end──▶ Ended
//!                       │                                     ▲
//!                       └────────────reject / end─────────────┘
//! ```

pub mod call;
pub mod coordinator;
pub mod messages;

use serde::{Deserialize, Serialize};

pub use call::{CallActor, CallHandle};
pub use coordinator::CallCoordinator;

/// Lifecycle state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Ringing,
    Connected,
    Ended,
}

impl CallState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Ringing => "ringing",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
        }
    }

    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, CallState::Ringing | CallState::Connected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Audio,
    Video,
}

/// The two identities of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallParticipants {
    pub caller_id: String,
    pub callee_id: String,
}

impl CallParticipants {
    #[must_use]
    pub fn contains(&self, user_id: &str) -> bool {
        self.caller_id == user_id || self.callee_id == user_id
    }

    /// True when `from` and `to` are the two participants, in either order.
    #[must_use]
    pub fn is_pair(&self, from: &str, to: &str) -> bool {
        (self.caller_id == from && self.callee_id == to)
            || (self.callee_id == from && self.caller_id == to)
    }
}

/// Final record of a call, returned when it ends.
#[derive(Debug, Clone)]
pub struct CallSummary {
    pub call_id: common::types::CallId,
    pub participants: CallParticipants,
    pub kind: CallKind,
    pub ended_by: String,
    /// Every state the call visited, in order.
    pub history: Vec<CallState>,
}
