//! Identity and domain event fixtures.

use chrono::Utc;
use serde_json::{json, Value};

/// Identity claim sent on the WebSocket handshake.
#[derive(Debug, Clone, Default)]
pub struct TestIdentity {
    pub user_id: Option<String>,
    pub role: Option<String>,
    pub organization_id: Option<String>,
}

impl TestIdentity {
    pub fn new(user_id: &str, role: Option<&str>) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            role: role.map(str::to_string),
            organization_id: None,
        }
    }

    pub fn patient(user_id: &str) -> Self {
        Self::new(user_id, Some("patient"))
    }

    pub fn provider(user_id: &str) -> Self {
        Self::new(user_id, Some("provider"))
    }

    pub fn admin(user_id: &str) -> Self {
        Self::new(user_id, Some("admin"))
    }

    /// A claim with no user id; the gateway must refuse it.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn in_org(mut self, organization_id: &str) -> Self {
        self.organization_id = Some(organization_id.to_string());
        self
    }

    /// Query string for `/live`, without the leading `?`.
    pub fn query(&self) -> String {
        let mut params = Vec::new();
        if let Some(user_id) = &self.user_id {
            params.push(format!("userId={user_id}"));
        }
        if let Some(role) = &self.role {
            params.push(format!("role={role}"));
        }
        if let Some(org) = &self.organization_id {
            params.push(format!("organizationId={org}"));
        }
        params.join("&")
    }
}

/// Heart-rate reading for `patient_id`, as pushed to `/internal/events`.
pub fn vital_event(patient_id: &str, bpm: f64) -> Value {
    json!({
        "kind": "vital",
        "patientId": patient_id,
        "type": "heart_rate",
        "values": { "bpm": bpm },
        "unit": "bpm",
        "status": if bpm > 120.0 { "critical" } else { "normal" },
        "timestamp": Utc::now().to_rfc3339(),
        "deviceId": "dev-1"
    })
}

/// Alert for `patient_id`; `severity` is `info`, `warning` or `critical`.
pub fn alert_event(patient_id: &str, severity: &str) -> Value {
    json!({
        "kind": "alert",
        "id": format!("alert-{patient_id}"),
        "patientId": patient_id,
        "type": "vital_threshold",
        "severity": severity,
        "title": "Heart rate out of range",
        "message": "Heart rate above threshold",
        "timestamp": Utc::now().to_rfc3339()
    })
}

pub fn notification_event(user_id: &str) -> Value {
    json!({
        "kind": "notification",
        "id": format!("notification-{user_id}"),
        "userId": user_id,
        "type": "reminder",
        "title": "Medication",
        "message": "Time for your evening dose",
        "timestamp": Utc::now().to_rfc3339()
    })
}

pub fn dashboard_event(organization_id: &str) -> Value {
    json!({
        "kind": "dashboard",
        "organizationId": organization_id,
        "stats": { "activePatients": 12, "openAlerts": 3 }
    })
}

/// A session description with whitespace and escapes that must survive the
/// relay untouched.
pub const SAMPLE_OFFER: &str =
    r#"{ "type": "offer",  "sdp": "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\n" }"#;

pub const SAMPLE_CANDIDATE: &str =
    r#"{"candidate":"candidate:1 1 UDP 2122252543 192.168.1.20 54321 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
