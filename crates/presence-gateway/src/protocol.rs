//! Wire protocol for the `/live` WebSocket.
//!
//! Client frames are `{"event": "<name>", "data": {...}, "ackId": n}`. `data`
//! stays raw JSON until the event name is resolved, so relayed session
//! descriptions and ICE candidates go back out byte-for-byte as submitted.
//!
//! Server frames are `{"event": "<name>", "data": {...}}`. Every request is
//! answered with an `ack` frame carrying either `success: true` or an error
//! code.

use crate::errors::GatewayError;
use crate::fanout::{AlertRaised, NotificationRaised, VitalReading};
use crate::identity::Role;
use crate::signaling::CallKind;
use chrono::{DateTime, Utc};
use common::types::CallId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

// ============================================================================
// Inbound
// ============================================================================

/// A client frame with its payload still unparsed.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFrame {
    pub event: String,
    #[serde(default)]
    pub data: Option<Box<RawValue>>,
    #[serde(default)]
    pub ack_id: Option<u64>,
}

impl RawFrame {
    /// Parse a text (or UTF-8 binary) frame.
    pub fn from_text(text: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(text)
            .map_err(|e| GatewayError::InvalidMessage(format!("malformed frame: {e}")))
    }

    /// Resolve the event name and parse the payload into a typed request.
    pub fn request(&self) -> Result<ClientRequest, GatewayError> {
        ClientRequest::parse(&self.event, self.data.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
}

/// Which signaling payload a relay carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    #[must_use]
    pub fn event_name(self) -> &'static str {
        match self {
            SignalKind::Offer => "webrtc:offer",
            SignalKind::Answer => "webrtc:answer",
            SignalKind::IceCandidate => "webrtc:ice-candidate",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatientPayload {
    patient_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitiatePayload {
    target_user_id: String,
    call_type: CallKind,
    #[serde(default)]
    caller_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnswerCallPayload {
    call_id: CallId,
    #[serde(default)]
    caller_id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndPayload {
    call_id: CallId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfferPayload {
    call_id: CallId,
    target_user_id: String,
    offer: Box<RawValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnswerPayload {
    call_id: CallId,
    target_user_id: String,
    answer: Box<RawValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidatePayload {
    call_id: CallId,
    target_user_id: String,
    candidate: Box<RawValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToggleMediaPayload {
    call_id: CallId,
    media_type: MediaType,
    enabled: bool,
}

/// A fully parsed client request.
#[derive(Debug)]
pub enum ClientRequest {
    SubscribePatient {
        patient_id: String,
    },
    UnsubscribePatient {
        patient_id: String,
    },
    SubscribeAlerts,
    Ping,
    InitiateCall {
        target_user_id: String,
        kind: CallKind,
        caller_name: Option<String>,
    },
    AcceptCall {
        call_id: CallId,
        caller_id: Option<String>,
    },
    RejectCall {
        call_id: CallId,
        caller_id: Option<String>,
        reason: Option<String>,
    },
    EndCall {
        call_id: CallId,
    },
    Relay {
        kind: SignalKind,
        call_id: CallId,
        target_user_id: String,
        payload: Box<RawValue>,
    },
    ToggleMedia {
        call_id: CallId,
        media_type: MediaType,
        enabled: bool,
    },
}

fn payload<T: DeserializeOwned>(event: &str, data: Option<&RawValue>) -> Result<T, GatewayError> {
    let data =
        data.ok_or_else(|| GatewayError::InvalidMessage(format!("{event} requires a payload")))?;
    serde_json::from_str(data.get())
        .map_err(|e| GatewayError::InvalidMessage(format!("invalid {event} payload: {e}")))
}

impl ClientRequest {
    pub fn parse(event: &str, data: Option<&RawValue>) -> Result<Self, GatewayError> {
        let request = match event {
            "subscribe:patient" => {
                let p: PatientPayload = payload(event, data)?;
                ClientRequest::SubscribePatient {
                    patient_id: p.patient_id,
                }
            }
            "unsubscribe:patient" => {
                let p: PatientPayload = payload(event, data)?;
                ClientRequest::UnsubscribePatient {
                    patient_id: p.patient_id,
                }
            }
            "subscribe:alerts" => ClientRequest::SubscribeAlerts,
            "ping" => ClientRequest::Ping,
            "call:initiate" => {
                let p: InitiatePayload = payload(event, data)?;
                ClientRequest::InitiateCall {
                    target_user_id: p.target_user_id,
                    kind: p.call_type,
                    caller_name: p.caller_name,
                }
            }
            "call:accept" => {
                let p: AnswerCallPayload = payload(event, data)?;
                ClientRequest::AcceptCall {
                    call_id: p.call_id,
                    caller_id: p.caller_id,
                }
            }
            "call:reject" => {
                let p: AnswerCallPayload = payload(event, data)?;
                ClientRequest::RejectCall {
                    call_id: p.call_id,
                    caller_id: p.caller_id,
                    reason: p.reason,
                }
            }
            "call:end" => {
                let p: EndPayload = payload(event, data)?;
                ClientRequest::EndCall { call_id: p.call_id }
            }
            "webrtc:offer" => {
                let p: OfferPayload = payload(event, data)?;
                ClientRequest::Relay {
                    kind: SignalKind::Offer,
                    call_id: p.call_id,
                    target_user_id: p.target_user_id,
                    payload: p.offer,
                }
            }
            "webrtc:answer" => {
                let p: AnswerPayload = payload(event, data)?;
                ClientRequest::Relay {
                    kind: SignalKind::Answer,
                    call_id: p.call_id,
                    target_user_id: p.target_user_id,
                    payload: p.answer,
                }
            }
            "webrtc:ice-candidate" => {
                let p: CandidatePayload = payload(event, data)?;
                ClientRequest::Relay {
                    kind: SignalKind::IceCandidate,
                    call_id: p.call_id,
                    target_user_id: p.target_user_id,
                    payload: p.candidate,
                }
            }
            "call:toggle-media" => {
                let p: ToggleMediaPayload = payload(event, data)?;
                ClientRequest::ToggleMedia {
                    call_id: p.call_id,
                    media_type: p.media_type,
                    enabled: p.enabled,
                }
            }
            other => {
                return Err(GatewayError::InvalidMessage(format!(
                    "unknown event: {other}"
                )))
            }
        };
        Ok(request)
    }

    /// Event name, used as a bounded metrics label.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientRequest::SubscribePatient { .. } => "subscribe:patient",
            ClientRequest::UnsubscribePatient { .. } => "unsubscribe:patient",
            ClientRequest::SubscribeAlerts => "subscribe:alerts",
            ClientRequest::Ping => "ping",
            ClientRequest::InitiateCall { .. } => "call:initiate",
            ClientRequest::AcceptCall { .. } => "call:accept",
            ClientRequest::RejectCall { .. } => "call:reject",
            ClientRequest::EndCall { .. } => "call:end",
            ClientRequest::Relay { kind, .. } => kind.event_name(),
            ClientRequest::ToggleMedia { .. } => "call:toggle-media",
        }
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// Every event the gateway pushes to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected {
        user_id: String,
        role: Option<Role>,
    },

    #[serde(rename = "vital:new")]
    VitalNew(VitalReading),

    #[serde(rename = "alert:new")]
    AlertNew(AlertRaised),

    #[serde(rename = "alert:critical")]
    AlertCritical(AlertRaised),

    #[serde(rename = "notification:new")]
    NotificationNew(NotificationRaised),

    #[serde(rename = "dashboard:update")]
    DashboardUpdate(serde_json::Value),

    #[serde(rename = "device:status")]
    DeviceStatus(serde_json::Value),

    #[serde(rename = "call:incoming", rename_all = "camelCase")]
    CallIncoming {
        call_id: CallId,
        caller_id: String,
        caller_name: Option<String>,
        call_type: CallKind,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "call:accepted", rename_all = "camelCase")]
    CallAccepted {
        call_id: CallId,
        accepted_by: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "call:rejected", rename_all = "camelCase")]
    CallRejected {
        call_id: CallId,
        rejected_by: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "call:ended", rename_all = "camelCase")]
    CallEnded {
        call_id: CallId,
        ended_by: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "webrtc:offer", rename_all = "camelCase")]
    WebrtcOffer {
        call_id: CallId,
        from_user_id: String,
        offer: Box<RawValue>,
    },

    #[serde(rename = "webrtc:answer", rename_all = "camelCase")]
    WebrtcAnswer {
        call_id: CallId,
        from_user_id: String,
        answer: Box<RawValue>,
    },

    #[serde(rename = "webrtc:ice-candidate", rename_all = "camelCase")]
    WebrtcIceCandidate {
        call_id: CallId,
        from_user_id: String,
        candidate: Box<RawValue>,
    },

    #[serde(rename = "call:media-toggled", rename_all = "camelCase")]
    CallMediaToggled {
        call_id: CallId,
        user_id: String,
        media_type: MediaType,
        enabled: bool,
    },

    #[serde(rename = "ack")]
    Ack(Ack),
}

impl ServerEvent {
    /// Build the relay event for `kind`.
    #[must_use]
    pub fn relay(
        kind: SignalKind,
        call_id: CallId,
        from_user_id: String,
        payload: Box<RawValue>,
    ) -> Self {
        match kind {
            SignalKind::Offer => ServerEvent::WebrtcOffer {
                call_id,
                from_user_id,
                offer: payload,
            },
            SignalKind::Answer => ServerEvent::WebrtcAnswer {
                call_id,
                from_user_id,
                answer: payload,
            },
            SignalKind::IceCandidate => ServerEvent::WebrtcIceCandidate {
                call_id,
                from_user_id,
                candidate: payload,
            },
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::VitalNew(_) => "vital:new",
            ServerEvent::AlertNew(_) => "alert:new",
            ServerEvent::AlertCritical(_) => "alert:critical",
            ServerEvent::NotificationNew(_) => "notification:new",
            ServerEvent::DashboardUpdate(_) => "dashboard:update",
            ServerEvent::DeviceStatus(_) => "device:status",
            ServerEvent::CallIncoming { .. } => "call:incoming",
            ServerEvent::CallAccepted { .. } => "call:accepted",
            ServerEvent::CallRejected { .. } => "call:rejected",
            ServerEvent::CallEnded { .. } => "call:ended",
            ServerEvent::WebrtcOffer { .. } => "webrtc:offer",
            ServerEvent::WebrtcAnswer { .. } => "webrtc:answer",
            ServerEvent::WebrtcIceCandidate { .. } => "webrtc:ice-candidate",
            ServerEvent::CallMediaToggled { .. } => "call:media-toggled",
            ServerEvent::Ack(_) => "ack",
        }
    }

    /// Serialize to a text frame.
    pub fn to_frame(&self) -> Result<String, GatewayError> {
        serde_json::to_string(self)
            .map_err(|e| GatewayError::Internal(format!("failed to encode {}: {e}", self.name())))
    }
}

/// Reply to a single client request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<u64>,
    #[serde(flatten)]
    pub body: AckBody,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AckBody {
    Success {
        success: bool,
        #[serde(rename = "callId", skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
    },
    Pong {
        event: &'static str,
        timestamp: i64,
    },
    Error {
        error: &'static str,
    },
}

impl AckBody {
    #[must_use]
    pub fn ok() -> Self {
        AckBody::Success {
            success: true,
            call_id: None,
        }
    }

    #[must_use]
    pub fn ok_with_call(call_id: CallId) -> Self {
        AckBody::Success {
            success: true,
            call_id: Some(call_id),
        }
    }

    #[must_use]
    pub fn pong(now: DateTime<Utc>) -> Self {
        AckBody::Pong {
            event: "pong",
            timestamp: now.timestamp_millis(),
        }
    }

    #[must_use]
    pub fn error(err: &GatewayError) -> Self {
        AckBody::Error {
            error: err.error_code(),
        }
    }
}
