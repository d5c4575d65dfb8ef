//! Topic membership index.
//!
//! Topics exist only while they have members: the first join creates one and
//! the last leave deletes it. A reverse map from connection to topics keeps
//! `leave_all` proportional to the connection's own memberships.
//!
//! Broadcast snapshots the member handles under the read lock and delivers
//! after releasing it, so a broadcast sees membership as of invocation.

use crate::observability::metrics;
use crate::registry::{ConnectionHandle, Outbound};
use crate::topic::Topic;
use common::types::ConnectionId;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct Memberships {
    topics: HashMap<Topic, HashMap<ConnectionId, ConnectionHandle>>,
    by_connection: HashMap<ConnectionId, HashSet<Topic>>,
}

impl Memberships {
    /// Remove one membership. Returns true if the topic was deleted.
    fn remove(&mut self, connection_id: ConnectionId, topic: &Topic) -> bool {
        let Some(members) = self.topics.get_mut(topic) else {
            return false;
        };
        members.remove(&connection_id);

        if let Some(joined) = self.by_connection.get_mut(&connection_id) {
            joined.remove(topic);
            if joined.is_empty() {
                self.by_connection.remove(&connection_id);
            }
        }

        if members.is_empty() {
            self.topics.remove(topic);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Default)]
pub struct TopicIndex {
    inner: RwLock<Memberships>,
}

impl TopicIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a topic, creating the topic on first use.
    ///
    /// Idempotent. Authorization is the caller's responsibility.
    pub async fn join(&self, connection: &ConnectionHandle, topic: Topic) {
        let connection_id = connection.connection_id();
        let topic_count = {
            let mut inner = self.inner.write().await;
            inner
                .by_connection
                .entry(connection_id)
                .or_default()
                .insert(topic.clone());
            inner
                .topics
                .entry(topic.clone())
                .or_default()
                .insert(connection_id, connection.clone());
            inner.topics.len()
        };

        metrics::set_topics_active(topic_count);
        trace!(
            target: "gw.index",
            connection_id = %connection_id,
            topic = topic.kind(),
            "Joined topic"
        );
    }

    /// Remove a connection from a topic. Deletes the topic if it empties.
    pub async fn leave(&self, connection_id: ConnectionId, topic: &Topic) {
        let (deleted, topic_count) = {
            let mut inner = self.inner.write().await;
            let deleted = inner.remove(connection_id, topic);
            (deleted, inner.topics.len())
        };

        if deleted {
            metrics::set_topics_active(topic_count);
            trace!(target: "gw.index", topic = topic.kind(), "Topic emptied and deleted");
        }
    }

    /// Remove a connection from every topic it is in.
    ///
    /// Returns the topics it left.
    pub async fn leave_all(&self, connection_id: ConnectionId) -> Vec<Topic> {
        let (left, topic_count) = {
            let mut inner = self.inner.write().await;
            let topics: Vec<Topic> = inner
                .by_connection
                .remove(&connection_id)
                .map(|set| set.into_iter().collect())
                .unwrap_or_default();

            for topic in &topics {
                if let Some(members) = inner.topics.get_mut(topic) {
                    members.remove(&connection_id);
                    if members.is_empty() {
                        inner.topics.remove(topic);
                    }
                }
            }
            (topics, inner.topics.len())
        };

        metrics::set_topics_active(topic_count);
        debug!(
            target: "gw.index",
            connection_id = %connection_id,
            topics = left.len(),
            "Connection left all topics"
        );
        left
    }

    /// Delete a topic and every membership in it.
    pub async fn remove_topic(&self, topic: &Topic) {
        let topic_count = {
            let mut inner = self.inner.write().await;
            if let Some(members) = inner.topics.remove(topic) {
                for connection_id in members.keys() {
                    if let Some(joined) = inner.by_connection.get_mut(connection_id) {
                        joined.remove(topic);
                        if joined.is_empty() {
                            inner.by_connection.remove(connection_id);
                        }
                    }
                }
            }
            inner.topics.len()
        };
        metrics::set_topics_active(topic_count);
    }

    /// Snapshot of a topic's members.
    pub async fn members(&self, topic: &Topic) -> HashSet<ConnectionId> {
        self.inner
            .read()
            .await
            .topics
            .get(topic)
            .map(|members| members.keys().copied().collect())
            .unwrap_or_default()
    }

    pub async fn is_member(&self, connection_id: ConnectionId, topic: &Topic) -> bool {
        self.inner
            .read()
            .await
            .topics
            .get(topic)
            .is_some_and(|members| members.contains_key(&connection_id))
    }

    pub async fn topics_of(&self, connection_id: ConnectionId) -> HashSet<Topic> {
        self.inner
            .read()
            .await
            .by_connection
            .get(&connection_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn topic_count(&self) -> usize {
        self.inner.read().await.topics.len()
    }

    /// Deliver `event` to every current member except `excluding`.
    ///
    /// Returns the number of connections the event was enqueued for. An empty
    /// or missing topic drops the event silently.
    pub async fn broadcast(
        &self,
        topic: &Topic,
        event: Outbound,
        excluding: Option<ConnectionId>,
    ) -> usize {
        let recipients: Vec<ConnectionHandle> = {
            let inner = self.inner.read().await;
            match inner.topics.get(topic) {
                Some(members) => members
                    .iter()
                    .filter(|(id, _)| Some(**id) != excluding)
                    .map(|(_, handle)| handle.clone())
                    .collect(),
                None => Vec::new(),
            }
        };

        let delivered = recipients
            .iter()
            .filter(|handle| handle.deliver(event.clone()))
            .count();

        trace!(
            target: "gw.index",
            topic = topic.kind(),
            event = event.name(),
            recipients = recipients.len(),
            delivered,
            "Broadcast"
        );
        delivered
    }

    /// Deliver `event` once to every connection in any of `topics`.
    ///
    /// A connection in several of the topics still receives one copy.
    pub async fn broadcast_many(&self, topics: &[Topic], event: Outbound) -> usize {
        let recipients: Vec<ConnectionHandle> = {
            let inner = self.inner.read().await;
            let mut seen = HashSet::new();
            topics
                .iter()
                .filter_map(|topic| inner.topics.get(topic))
                .flat_map(|members| members.iter())
                .filter(|(id, _)| seen.insert(**id))
                .map(|(_, handle)| handle.clone())
                .collect()
        };

        recipients
            .iter()
            .filter(|handle| handle.deliver(event.clone()))
            .count()
    }
}
