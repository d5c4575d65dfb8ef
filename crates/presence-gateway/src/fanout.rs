//! Domain event fanout.
//!
//! External collaborators push immutable facts (vital readings, alerts,
//! notifications, dashboard and device updates). Each kind maps to a fixed
//! set of topics; publishing resolves those topics through the index and
//! enqueues one copy per member connection. Nothing is stored or retried.

use crate::identity::Role;
use crate::index::TopicIndex;
use crate::observability::metrics;
use crate::protocol::ServerEvent;
use crate::topic::Topic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VitalStatus {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A vital-sign reading for one patient.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VitalReading {
    pub patient_id: String,
    #[serde(rename = "type")]
    pub vital_type: String,
    pub values: HashMap<String, f64>,
    pub unit: String,
    pub status: VitalStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRaised {
    pub id: String,
    pub patient_id: String,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRaised {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Every kind of event collaborators can publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainEvent {
    Vital(VitalReading),
    Alert(AlertRaised),
    Notification(NotificationRaised),
    Dashboard {
        #[serde(rename = "organizationId")]
        organization_id: String,
        stats: serde_json::Value,
    },
    DeviceStatus {
        #[serde(rename = "patientId")]
        patient_id: String,
        device: serde_json::Value,
    },
}

impl DomainEvent {
    /// Metrics label for the event kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::Vital(_) => "vital",
            DomainEvent::Alert(_) => "alert",
            DomainEvent::Notification(_) => "notification",
            DomainEvent::Dashboard { .. } => "dashboard",
            DomainEvent::DeviceStatus { .. } => "device_status",
        }
    }

    /// Resolve the outbound events and the topics each goes to.
    fn plan(self) -> Vec<(ServerEvent, Vec<Topic>)> {
        match self {
            DomainEvent::Vital(reading) => {
                let topics = vec![
                    Topic::patient(reading.patient_id.clone()),
                    Topic::user(reading.patient_id.clone()),
                ];
                vec![(ServerEvent::VitalNew(reading), topics)]
            }
            DomainEvent::Alert(alert) => {
                let critical = alert.severity == Severity::Critical;
                let topics = vec![Topic::patient(alert.patient_id.clone()), Topic::AlertsAll];
                let mut plan = vec![(ServerEvent::AlertNew(alert.clone()), topics)];
                if critical {
                    plan.push((
                        ServerEvent::AlertCritical(alert),
                        vec![Topic::role(&Role::Provider), Topic::role(&Role::Admin)],
                    ));
                }
                plan
            }
            DomainEvent::Notification(notification) => {
                let topics = vec![Topic::user(notification.user_id.clone())];
                vec![(ServerEvent::NotificationNew(notification), topics)]
            }
            DomainEvent::Dashboard {
                organization_id,
                stats,
            } => vec![(
                ServerEvent::DashboardUpdate(stats),
                vec![Topic::org(organization_id)],
            )],
            DomainEvent::DeviceStatus { patient_id, device } => vec![(
                ServerEvent::DeviceStatus(device),
                vec![Topic::patient(patient_id)],
            )],
        }
    }
}

/// Result of a publish: which topics were targeted and how many deliveries
/// were enqueued.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanoutReport {
    pub topics: Vec<String>,
    pub delivered: usize,
}

/// Stateless dispatcher from domain events to topics.
#[derive(Debug, Clone)]
pub struct FanoutService {
    index: Arc<TopicIndex>,
}

impl FanoutService {
    #[must_use]
    pub fn new(index: Arc<TopicIndex>) -> Self {
        Self { index }
    }

    /// Publish an event to every current member of its topics.
    ///
    /// Topics without members are skipped silently.
    #[instrument(skip_all, name = "gw.fanout.publish", fields(kind = event.kind()))]
    pub async fn publish(&self, event: DomainEvent) -> FanoutReport {
        let kind = event.kind();
        metrics::record_event_published(kind);

        let mut report = FanoutReport::default();
        for (outbound, topics) in event.plan() {
            let name = outbound.name();
            let delivered = self
                .index
                .broadcast_many(&topics, Arc::new(outbound))
                .await;

            debug!(
                target: "gw.fanout",
                kind,
                event = name,
                topics = topics.len(),
                delivered,
                "Fanned out event"
            );

            report.delivered += delivered;
            report
                .topics
                .extend(topics.iter().map(ToString::to_string));
        }
        report
    }
}
