//! The `Gateway` instance.
//!
//! One `Gateway` owns the connection registry, the topic index, the fanout
//! service and the call table. Connection workers and HTTP handlers share it
//! through an `Arc`; tests build as many isolated instances as they need.

use crate::authz;
use crate::config::Config;
use crate::errors::GatewayError;
use crate::fanout::{DomainEvent, FanoutReport, FanoutService};
use crate::identity::IdentityClaim;
use crate::index::TopicIndex;
use crate::observability::metrics;
use crate::protocol::{AckBody, ClientRequest, ServerEvent};
use crate::registry::{ConnectionHandle, ConnectionRegistry, Outbound};
use crate::signaling::{CallCoordinator, CallState};
use crate::topic::Topic;
use chrono::Utc;
use common::types::ConnectionId;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Counts reported by `GET /stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub connections: usize,
    pub topics: usize,
    pub calls: usize,
}

pub struct Gateway {
    registry: Arc<ConnectionRegistry>,
    index: Arc<TopicIndex>,
    fanout: FanoutService,
    calls: CallCoordinator,
    outbound_queue_capacity: usize,
    cancel_token: CancellationToken,
}

impl Gateway {
    /// Create a gateway. Every connection and call actor runs under a child
    /// of `cancel_token`.
    #[must_use]
    pub fn new(config: &Config, cancel_token: CancellationToken) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let index = Arc::new(TopicIndex::new());
        let fanout = FanoutService::new(Arc::clone(&index));
        let calls = CallCoordinator::new(
            Arc::clone(&index),
            Arc::clone(&registry),
            config.ended_call_retention,
            cancel_token.child_token(),
        );

        Self {
            registry,
            index,
            fanout,
            calls,
            outbound_queue_capacity: config.outbound_queue_capacity,
            cancel_token,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    #[must_use]
    pub fn index(&self) -> &TopicIndex {
        &self.index
    }

    #[must_use]
    pub fn calls(&self) -> &CallCoordinator {
        &self.calls
    }

    /// Admit a new connection.
    ///
    /// Registers it, joins `user:<id>` and, when present, `role:<role>` and
    /// `org:<id>`, then queues `connected` as its first event. Returns the
    /// handle and the receiving end of its outbound queue.
    ///
    /// # Errors
    ///
    /// `IdentityMissing` if the claim carries no user id.
    #[instrument(skip_all, name = "gw.registry.admit", fields(connection_id = %connection_id))]
    pub async fn admit(
        &self,
        connection_id: ConnectionId,
        claim: IdentityClaim,
    ) -> Result<(ConnectionHandle, mpsc::Receiver<Outbound>), GatewayError> {
        let identity = claim.into_identity()?;

        let mut topics = vec![Topic::user(identity.user_id.clone())];
        if let Some(role) = &identity.role {
            topics.push(Topic::role(role));
        }
        if let Some(org) = &identity.organization_id {
            topics.push(Topic::org(org.clone()));
        }

        let (handle, receiver) = ConnectionHandle::new(
            connection_id,
            identity,
            self.outbound_queue_capacity,
            self.cancel_token.child_token(),
        );

        self.registry.insert(handle.clone()).await;
        for topic in topics {
            self.index.join(&handle, topic).await;
        }

        handle.deliver(Arc::new(ServerEvent::Connected {
            user_id: handle.user_id().to_string(),
            role: handle.identity().role.clone(),
        }));

        info!(
            target: "gw.registry",
            connection_id = %connection_id,
            user_id = %handle.user_id(),
            role = ?handle.identity().role,
            "Connection admitted"
        );
        Ok((handle, receiver))
    }

    /// Remove a connection from the registry and every topic, and end any
    /// call it takes part in. Unknown ids are ignored.
    #[instrument(skip_all, name = "gw.registry.remove", fields(connection_id = %connection_id))]
    pub async fn remove(&self, connection_id: ConnectionId) -> Option<ConnectionHandle> {
        let handle = self.registry.remove(connection_id).await?;
        handle.close();

        let topics = self.index.leave_all(connection_id).await;
        self.calls.connection_closed(&handle).await;

        info!(
            target: "gw.registry",
            connection_id = %connection_id,
            user_id = %handle.user_id(),
            topics = topics.len(),
            "Connection removed"
        );
        Some(handle)
    }

    /// Join `topic` after the authorization guard approves it.
    pub async fn subscribe(
        &self,
        connection: &ConnectionHandle,
        topic: Topic,
    ) -> Result<(), GatewayError> {
        // A call topic exists only while the call is connected.
        let participants = match &topic {
            Topic::Call(call_id) => {
                match self.calls.state(*call_id).await {
                    Some(CallState::Connected) => self.calls.participants(*call_id).await,
                    _ => None,
                }
            }
            _ => None,
        };
        let pair = participants
            .as_ref()
            .map(|p| (p.caller_id.as_str(), p.callee_id.as_str()));

        if !authz::can_join(connection.identity(), &topic, pair) {
            warn!(
                target: "gw.index",
                connection_id = %connection.connection_id(),
                user_id = %connection.user_id(),
                topic_kind = topic.kind(),
                "Topic join denied"
            );
            return Err(GatewayError::Unauthorized {
                topic: topic.to_string(),
            });
        }

        self.index.join(connection, topic).await;
        Ok(())
    }

    /// Join a topic given by name, e.g. `patient:p1`.
    ///
    /// # Errors
    ///
    /// `UnknownTopic` if the name matches no topic pattern, otherwise as
    /// [`Gateway::subscribe`].
    pub async fn subscribe_named(
        &self,
        connection: &ConnectionHandle,
        name: &str,
    ) -> Result<(), GatewayError> {
        let topic: Topic = name.parse()?;
        self.subscribe(connection, topic).await
    }

    /// Handle one client request and build its acknowledgement.
    ///
    /// Failures are returned to the requester and never close the connection.
    #[instrument(
        skip_all,
        name = "gw.ws.request",
        fields(event = request.event_name(), connection_id = %connection.connection_id())
    )]
    pub async fn handle_request(
        &self,
        connection: &ConnectionHandle,
        request: ClientRequest,
    ) -> AckBody {
        let event = request.event_name();
        let start = Instant::now();

        let (outcome, ack) = match self.dispatch(connection, request).await {
            Ok(ack) => ("success", ack),
            Err(e) => {
                debug!(
                    target: "gw.ws",
                    connection_id = %connection.connection_id(),
                    event,
                    error = %e,
                    "Request failed"
                );
                (e.error_code(), AckBody::error(&e))
            }
        };

        metrics::record_request(event, outcome, start.elapsed());
        ack
    }

    async fn dispatch(
        &self,
        connection: &ConnectionHandle,
        request: ClientRequest,
    ) -> Result<AckBody, GatewayError> {
        let user_id = connection.user_id();

        match request {
            ClientRequest::SubscribePatient { patient_id } => {
                self.subscribe(connection, Topic::patient(patient_id))
                    .await?;
                Ok(AckBody::ok())
            }
            ClientRequest::UnsubscribePatient { patient_id } => {
                self.index
                    .leave(connection.connection_id(), &Topic::patient(patient_id))
                    .await;
                Ok(AckBody::ok())
            }
            ClientRequest::SubscribeAlerts => {
                self.subscribe(connection, Topic::AlertsAll).await?;
                Ok(AckBody::ok())
            }
            ClientRequest::Ping => Ok(AckBody::pong(Utc::now())),
            ClientRequest::InitiateCall {
                target_user_id,
                kind,
                caller_name,
            } => {
                let call_id = self
                    .calls
                    .initiate(connection, target_user_id, kind, caller_name)
                    .await?;
                Ok(AckBody::ok_with_call(call_id))
            }
            ClientRequest::AcceptCall { call_id, caller_id } => {
                self.calls
                    .accept(call_id, connection, caller_id.as_deref())
                    .await?;
                Ok(AckBody::ok_with_call(call_id))
            }
            ClientRequest::RejectCall {
                call_id,
                caller_id,
                reason,
            } => {
                self.calls
                    .reject(call_id, user_id, caller_id.as_deref(), reason)
                    .await?;
                Ok(AckBody::ok())
            }
            ClientRequest::EndCall { call_id } => {
                self.calls.end(call_id, user_id).await?;
                Ok(AckBody::ok())
            }
            ClientRequest::Relay {
                kind,
                call_id,
                target_user_id,
                payload,
            } => {
                self.calls
                    .relay(call_id, kind, user_id, target_user_id, payload)
                    .await?;
                Ok(AckBody::ok())
            }
            ClientRequest::ToggleMedia {
                call_id,
                media_type,
                enabled,
            } => {
                self.calls
                    .toggle_media(call_id, connection, media_type, enabled)
                    .await?;
                Ok(AckBody::ok())
            }
        }
    }

    /// Publish a domain event to its topics.
    pub async fn publish(&self, event: DomainEvent) -> FanoutReport {
        self.fanout.publish(event).await
    }

    pub async fn stats(&self) -> GatewayStats {
        GatewayStats {
            connections: self.registry.count().await,
            topics: self.index.topic_count().await,
            calls: self.calls.live_count().await,
        }
    }

    /// Close every connection and stop every call actor.
    pub fn shutdown(&self) {
        info!(target: "gw.registry", "Gateway shutting down");
        self.calls.shutdown();
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::fanout::{AlertRaised, Severity, VitalReading, VitalStatus};
    use crate::protocol::RawFrame;
    use std::collections::HashMap;

    fn gateway() -> Gateway {
        Gateway::new(&Config::default(), CancellationToken::new())
    }

    fn claim(user_id: &str, role: Option<&str>, org: Option<&str>) -> IdentityClaim {
        IdentityClaim {
            user_id: Some(user_id.to_string()),
            role: role.map(str::to_string),
            organization_id: org.map(str::to_string),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn request(text: &str) -> ClientRequest {
        RawFrame::from_text(text).unwrap().request().unwrap()
    }

    fn vital(patient_id: &str) -> DomainEvent {
        DomainEvent::Vital(VitalReading {
            patient_id: patient_id.to_string(),
            vital_type: "heart_rate".to_string(),
            values: HashMap::from([("bpm".to_string(), 72.0)]),
            unit: "bpm".to_string(),
            status: VitalStatus::Normal,
            timestamp: Utc::now(),
            device_id: None,
        })
    }

    #[tokio::test]
    async fn test_admit_joins_default_topics() {
        let gw = gateway();
        let (conn, mut rx) = gw
            .admit(ConnectionId::new(), claim("u", Some("provider"), Some("o1")))
            .await
            .unwrap();
        let id = conn.connection_id();

        assert!(gw.index().is_member(id, &Topic::user("u")).await);
        assert!(gw.index().is_member(id, &Topic::Role("provider".to_string())).await);
        assert!(gw.index().is_member(id, &Topic::org("o1")).await);
        assert_eq!(gw.index().topics_of(id).await.len(), 3);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events.first().map(AsRef::as_ref),
            Some(ServerEvent::Connected { user_id, .. }) if user_id == "u"
        ));
    }

    #[tokio::test]
    async fn test_admit_without_user_id_is_rejected() {
        let gw = gateway();
        let err = gw
            .admit(ConnectionId::new(), IdentityClaim::default())
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(gw.registry().count().await, 0);
    }

    #[tokio::test]
    async fn test_patient_cannot_watch_another_patient() {
        let gw = gateway();
        let (conn, _rx) = gw
            .admit(ConnectionId::new(), claim("p1", Some("patient"), None))
            .await
            .unwrap();

        let ack = gw
            .handle_request(
                &conn,
                request(r#"{"event":"subscribe:patient","data":{"patientId":"p2"}}"#),
            )
            .await;

        assert_eq!(ack, AckBody::Error { error: "Unauthorized" });
        assert!(!gw
            .index()
            .is_member(conn.connection_id(), &Topic::patient("p2"))
            .await);
        assert!(!conn.is_closed(), "a denied join keeps the connection open");
    }

    #[tokio::test]
    async fn test_vital_reaches_patient_and_watching_provider() {
        let gw = gateway();
        let (patient, mut patient_rx) = gw
            .admit(ConnectionId::new(), claim("u1", Some("patient"), None))
            .await
            .unwrap();
        let (provider, mut provider_rx) = gw
            .admit(ConnectionId::new(), claim("u2", Some("provider"), None))
            .await
            .unwrap();

        let ack = gw
            .handle_request(
                &provider,
                request(r#"{"event":"subscribe:patient","data":{"patientId":"u1"}}"#),
            )
            .await;
        assert_eq!(ack, AckBody::ok());
        drain(&mut patient_rx);
        drain(&mut provider_rx);

        let report = gw.publish(vital("u1")).await;

        assert_eq!(report.delivered, 2);
        let names = |events: Vec<Outbound>| events.iter().map(|e| e.name()).collect::<Vec<_>>();
        assert_eq!(names(drain(&mut patient_rx)), vec!["vital:new"]);
        assert_eq!(names(drain(&mut provider_rx)), vec!["vital:new"]);
        assert_eq!(patient.user_id(), "u1");
    }

    #[tokio::test]
    async fn test_critical_alert_reaches_care_team() {
        let gw = gateway();
        let (_admin, mut admin_rx) = gw
            .admit(ConnectionId::new(), claim("a1", Some("admin"), None))
            .await
            .unwrap();
        let (_other, mut other_rx) = gw
            .admit(ConnectionId::new(), claim("x1", Some("patient"), None))
            .await
            .unwrap();
        drain(&mut admin_rx);
        drain(&mut other_rx);

        let report = gw
            .publish(DomainEvent::Alert(AlertRaised {
                id: "al1".to_string(),
                patient_id: "p9".to_string(),
                alert_type: "vital_threshold".to_string(),
                severity: Severity::Critical,
                title: "SpO2 low".to_string(),
                message: "SpO2 at 84%".to_string(),
                timestamp: Utc::now(),
            }))
            .await;

        assert_eq!(
            report.topics,
            vec!["patient:p9", "alerts:all", "role:provider", "role:admin"]
        );
        let names: Vec<_> = drain(&mut admin_rx).iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["alert:critical"]);
        assert!(drain(&mut other_rx).is_empty());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let gw = gateway();
        let (conn, _rx) = gw
            .admit(ConnectionId::new(), claim("u1", Some("patient"), Some("o1")))
            .await
            .unwrap();

        assert!(gw.remove(conn.connection_id()).await.is_some());
        assert!(gw.remove(conn.connection_id()).await.is_none());
        assert!(conn.is_closed());
        assert_eq!(
            gw.stats().await,
            GatewayStats {
                connections: 0,
                topics: 0,
                calls: 0
            }
        );
    }

    #[tokio::test]
    async fn test_ping_answers_pong() {
        let gw = gateway();
        let (conn, _rx) = gw
            .admit(ConnectionId::new(), claim("u1", None, None))
            .await
            .unwrap();

        let ack = gw
            .handle_request(&conn, request(r#"{"event":"ping"}"#))
            .await;
        assert!(matches!(ack, AckBody::Pong { event: "pong", .. }));
    }

    #[tokio::test]
    async fn test_named_subscribe_rejects_unknown_topic() {
        let gw = gateway();
        let (conn, _rx) = gw
            .admit(ConnectionId::new(), claim("u1", Some("admin"), None))
            .await
            .unwrap();

        let err = gw.subscribe_named(&conn, "ward:7").await.unwrap_err();
        assert_eq!(err.error_code(), "UnknownTopic");

        gw.subscribe_named(&conn, "alerts:all").await.unwrap();
        assert!(gw
            .index()
            .is_member(conn.connection_id(), &Topic::AlertsAll)
            .await);
    }

    #[tokio::test]
    async fn test_call_topic_limited_to_participants() {
        let gw = gateway();
        let (caller, _a) = gw
            .admit(ConnectionId::new(), claim("u1", None, None))
            .await
            .unwrap();
        let (stranger, _c) = gw
            .admit(ConnectionId::new(), claim("u3", Some("superadmin"), None))
            .await
            .unwrap();
        let (callee, _b) = gw
            .admit(ConnectionId::new(), claim("u2", None, None))
            .await
            .unwrap();

        let call_id = gw
            .calls()
            .initiate(&caller, "u2".to_string(), crate::signaling::CallKind::Audio, None)
            .await
            .unwrap();

        // Not joinable while ringing, not even by a participant.
        let err = gw
            .subscribe(&caller, Topic::Call(call_id))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "Unauthorized");

        gw.calls().accept(call_id, &callee, Some("u1")).await.unwrap();

        let err = gw
            .subscribe(&stranger, Topic::Call(call_id))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "Unauthorized");
        gw.subscribe(&caller, Topic::Call(call_id)).await.unwrap();
    }

    #[tokio::test]
    async fn test_ending_ringing_call_leaves_no_call_topic() {
        let gw = gateway();
        let (caller, _a) = gw
            .admit(ConnectionId::new(), claim("u1", None, None))
            .await
            .unwrap();
        gw.admit(ConnectionId::new(), claim("u2", None, None))
            .await
            .unwrap();
        let topics_before = gw.stats().await.topics;

        let call_id = gw
            .calls()
            .initiate(&caller, "u2".to_string(), crate::signaling::CallKind::Video, None)
            .await
            .unwrap();
        assert!(gw.subscribe(&caller, Topic::Call(call_id)).await.is_err());
        gw.calls().end(call_id, "u1").await.unwrap();

        assert!(gw.index().members(&Topic::Call(call_id)).await.is_empty());
        assert_eq!(gw.stats().await.topics, topics_before);
    }

    #[tokio::test]
    async fn test_relay_payload_is_byte_identical() {
        let gw = gateway();
        let (caller, _caller_rx) = gw
            .admit(ConnectionId::new(), claim("u1", None, None))
            .await
            .unwrap();
        let (_callee, mut callee_rx) = gw
            .admit(ConnectionId::new(), claim("u2", None, None))
            .await
            .unwrap();

        let ack = gw
            .handle_request(
                &caller,
                request(r#"{"event":"call:initiate","data":{"targetUserId":"u2","callType":"video"}}"#),
            )
            .await;
        let AckBody::Success {
            call_id: Some(call_id),
            ..
        } = ack
        else {
            unreachable!("initiate must return a call id");
        };

        let offer = r#"{ "type":"offer",  "sdp":"v=0\r\no=- 46117 2 IN IP4 127.0.0.1\r\n" }"#;
        let frame = format!(
            r#"{{"event":"webrtc:offer","data":{{"callId":"{call_id}","targetUserId":"u2","offer":{offer}}}}}"#
        );
        let ack = gw.handle_request(&caller, request(&frame)).await;
        assert_eq!(ack, AckBody::ok());

        let delivered = drain(&mut callee_rx);
        let relayed = delivered
            .iter()
            .find(|e| e.name() == "webrtc:offer")
            .expect("offer relayed");
        let text = relayed.to_frame().unwrap();
        assert!(text.contains(offer), "payload must be relayed verbatim");
    }
}
