//! Gateway error types.
//!
//! Every request-level failure maps to a stable wire code returned to the
//! requester as `{"error": "<code>"}`. Only `IdentityMissing` is fatal, and only
//! to the connection attempt that produced it. Internal details are logged
//! server-side but never sent to clients.

use crate::signaling::CallState;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::types::CallId;
use serde::Serialize;
use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The Authorization Guard denied a topic join.
    #[error("Unauthorized to join {topic}")]
    Unauthorized { topic: String },

    /// The requested topic does not match any known pattern.
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// The call cannot perform `action` from its current state.
    #[error("Call {call_id} cannot {action} while {from:?}")]
    InvalidStateTransition {
        call_id: CallId,
        from: CallState,
        action: &'static str,
    },

    /// The user is not one of the two participants of the call.
    #[error("User {user_id} is not a participant of call {call_id}")]
    NotAParticipant { call_id: CallId, user_id: String },

    /// The user already owns a ringing or connected call.
    #[error("User {user_id} is already in call {call_id}")]
    AlreadyInCall { user_id: String, call_id: CallId },

    /// The handshake identity claim carried no user id.
    #[error("Identity claim is missing a user id")]
    IdentityMissing,

    /// The call id was never issued by this gateway.
    #[error("Call not found: {0}")]
    CallNotFound(CallId),

    /// Malformed frame, unknown event name or invalid payload.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Internal failure (actor mailbox closed, serialization failure).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Returns the wire error code sent to clients.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized { .. } => "Unauthorized",
            GatewayError::UnknownTopic(_) => "UnknownTopic",
            GatewayError::InvalidStateTransition { .. } => "InvalidStateTransition",
            GatewayError::NotAParticipant { .. } => "NotAParticipant",
            GatewayError::AlreadyInCall { .. } => "AlreadyInCall",
            GatewayError::IdentityMissing => "IdentityMissing",
            GatewayError::CallNotFound(_) => "CallNotFound",
            GatewayError::InvalidMessage(_) => "InvalidMessage",
            GatewayError::Internal(_) => "InternalError",
        }
    }

    /// Whether this error must close the connection attempt.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::IdentityMissing)
    }

    /// HTTP status for the ingest and handshake surfaces.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::IdentityMissing => StatusCode::UNAUTHORIZED,
            GatewayError::Unauthorized { .. } | GatewayError::NotAParticipant { .. } => {
                StatusCode::FORBIDDEN
            }
            GatewayError::UnknownTopic(_) | GatewayError::InvalidMessage(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::CallNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidStateTransition { .. } | GatewayError::AlreadyInCall { .. } => {
                StatusCode::CONFLICT
            }
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let GatewayError::Internal(detail) = &self {
            tracing::error!(target: "gw.http", error = %detail, "Internal gateway error");
        }

        let body = ErrorResponse {
            error: self.error_code(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            GatewayError::Unauthorized {
                topic: "patient:p1".to_string()
            }
            .error_code(),
            "Unauthorized"
        );
        assert_eq!(
            GatewayError::UnknownTopic("weird:1".to_string()).error_code(),
            "UnknownTopic"
        );
        assert_eq!(
            GatewayError::InvalidStateTransition {
                call_id: CallId::new(),
                from: CallState::Ended,
                action: "accept",
            }
            .error_code(),
            "InvalidStateTransition"
        );
        assert_eq!(
            GatewayError::NotAParticipant {
                call_id: CallId::new(),
                user_id: "u9".to_string()
            }
            .error_code(),
            "NotAParticipant"
        );
        assert_eq!(
            GatewayError::AlreadyInCall {
                user_id: "u1".to_string(),
                call_id: CallId::new()
            }
            .error_code(),
            "AlreadyInCall"
        );
        assert_eq!(GatewayError::IdentityMissing.error_code(), "IdentityMissing");
        assert_eq!(
            GatewayError::Internal("mailbox closed".to_string()).error_code(),
            "InternalError"
        );
    }

    #[test]
    fn test_only_identity_missing_is_fatal() {
        assert!(GatewayError::IdentityMissing.is_fatal());
        assert!(!GatewayError::Unauthorized {
            topic: "alerts:all".to_string()
        }
        .is_fatal());
        assert!(!GatewayError::InvalidMessage("bad".to_string()).is_fatal());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            GatewayError::IdentityMissing.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::InvalidMessage("x".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::CallNotFound(CallId::new()).status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_into_response_hides_internal_detail() {
        let response =
            GatewayError::Internal("channel send failed: 10.0.0.4".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = http_body_util::BodyExt::collect(response.into_body())
            .await
            .expect("collect body")
            .to_bytes();
        let text = String::from_utf8(body.to_vec()).expect("utf8");
        assert_eq!(text, r#"{"error":"InternalError"}"#);
    }
}
