//! Consumer group registry
//!
//! Groups come into existence on first use and are garbage-collected the
//! moment their last consumer leaves — no explicit create/destroy surface.
//! A group's subscriptions and consumption offsets live only as long as
//! the group itself; durable offsets in the offset store outlive it and
//! are restored on the next subscribe.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::broker::connections::ConsumerId;
use crate::error::{MurmurError, Result};
use crate::message::Message;
use crate::store::SharedOffsetStore;

/// One topic subscription held by a group
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Subscribed topic
    pub topic: String,
    /// Tag filter; empty matches all tags
    pub tags: Vec<String>,
}

impl Subscription {
    /// Whether a message on this topic passes the tag filter
    pub fn matches(&self, message: &Message) -> bool {
        message.topic == self.topic && message.matches_tags(&self.tags)
    }
}

/// A live consumer group: subscriptions, online members, and per-topic
/// consumption offsets
pub struct ConsumerGroup {
    /// Group identifier
    pub group_id: String,
    subscriptions: DashMap<String, Subscription>,
    online: DashMap<ConsumerId, ()>,
    offsets: DashMap<String, u64>,
}

impl ConsumerGroup {
    fn new(group_id: String) -> Self {
        Self {
            group_id,
            subscriptions: DashMap::new(),
            online: DashMap::new(),
            offsets: DashMap::new(),
        }
    }

    /// Whether the group already subscribes to `topic`
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.contains_key(topic)
    }

    fn add_subscription(&self, subscription: Subscription) {
        self.subscriptions
            .insert(subscription.topic.clone(), subscription);
    }

    /// Drop a topic subscription and its in-memory offset. The durable
    /// offset record is retained; resubscribing restores it.
    fn remove_subscription(&self, topic: &str) -> bool {
        let removed = self.subscriptions.remove(topic).is_some();
        if removed {
            self.offsets.remove(topic);
        }
        removed
    }

    /// Subscriptions matching a message's topic and tags
    pub fn matching_subscriptions(&self, message: &Message) -> Vec<Subscription> {
        self.subscriptions
            .iter()
            .filter(|entry| entry.value().matches(message))
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn add_consumer(&self, id: ConsumerId) {
        self.online.insert(id, ());
    }

    fn remove_consumer(&self, id: &ConsumerId) -> bool {
        self.online.remove(id).is_some()
    }

    /// Whether the consumer is an online member of this group
    pub fn has_consumer(&self, id: &ConsumerId) -> bool {
        self.online.contains_key(id)
    }

    /// A group is empty (and eligible for GC) when no consumers are
    /// online, regardless of remaining subscriptions.
    pub fn is_empty(&self) -> bool {
        self.online.is_empty()
    }

    /// Online member ids in stable sorted order, for deterministic
    /// delivery targeting
    pub fn sorted_consumer_ids(&self) -> Vec<ConsumerId> {
        let mut ids: Vec<ConsumerId> = self.online.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Current consumption offset for a topic (0 when never advanced)
    pub fn offset(&self, topic: &str) -> u64 {
        self.offsets.get(topic).map(|v| *v).unwrap_or(0)
    }

    fn set_offset(&self, topic: &str, offset: u64) {
        self.offsets.insert(topic.to_string(), offset);
    }

    /// Advance the topic offset if `message_id` is ahead of it. Returns
    /// whether the offset actually moved; out-of-order acks are no-ops.
    pub fn try_advance_offset(&self, topic: &str, message_id: u64) -> bool {
        let mut advanced = false;
        self.offsets
            .entry(topic.to_string())
            .and_modify(|current| {
                if message_id > *current {
                    *current = message_id;
                    advanced = true;
                }
            })
            .or_insert_with(|| {
                advanced = true;
                message_id
            });
        advanced
    }
}

/// Result of a subscribe call, telling the caller whether a catch-up
/// replay is due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// The group already held this subscription; nothing changed
    AlreadySubscribed,
    /// Fresh subscription with no durable history
    Subscribed,
    /// Subscription restored a durable offset; messages with ids greater
    /// than `replay_after` should be replayed to the group
    Resubscribed {
        /// Offset recovered from the offset store
        replay_after: u64,
    },
}

/// Registry of live consumer groups
pub struct GroupRegistry {
    groups: DashMap<String, Arc<ConsumerGroup>>,
    offset_store: SharedOffsetStore,
}

/// Shared handle to a [`GroupRegistry`]
pub type SharedGroupRegistry = Arc<GroupRegistry>;

fn validate_group_id(group_id: &str) -> Result<()> {
    if group_id.is_empty() {
        return Err(MurmurError::InvalidArgument(
            "group id must not be empty".into(),
        ));
    }
    // These characters appear in offset-log line syntax and file names.
    if group_id.contains([':', '|', '/', '\\']) {
        return Err(MurmurError::InvalidArgument(format!(
            "group id {:?} contains a reserved character",
            group_id
        )));
    }
    Ok(())
}

impl GroupRegistry {
    /// Create a registry backed by the given offset store
    pub fn new(offset_store: SharedOffsetStore) -> Self {
        Self {
            groups: DashMap::new(),
            offset_store,
        }
    }

    /// Fetch a group, creating it on first reference
    pub fn get_or_create(&self, group_id: &str) -> Result<Arc<ConsumerGroup>> {
        validate_group_id(group_id)?;
        let group = self
            .groups
            .entry(group_id.to_string())
            .or_insert_with(|| {
                info!(group = group_id, "consumer group created");
                Arc::new(ConsumerGroup::new(group_id.to_string()))
            })
            .clone();
        Ok(group)
    }

    /// Fetch an existing group
    pub fn get(&self, group_id: &str) -> Option<Arc<ConsumerGroup>> {
        self.groups.get(group_id).map(|e| e.value().clone())
    }

    /// Subscribe a group to a topic. Recovers the group's durable offset
    /// for the topic, and reports whether a catch-up replay is due.
    /// Subscribing twice to the same topic is an idempotent no-op.
    pub fn subscribe(
        &self,
        group_id: &str,
        topic: &str,
        tags: Vec<String>,
    ) -> Result<SubscribeOutcome> {
        if topic.is_empty() {
            return Err(MurmurError::InvalidArgument(
                "topic must not be empty".into(),
            ));
        }
        let group = self.get_or_create(group_id)?;
        if group.is_subscribed(topic) {
            debug!(group = group_id, topic, "already subscribed");
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }

        let recovered = self.offset_store.recover_one(group_id, topic)?;
        group.add_subscription(Subscription {
            topic: topic.to_string(),
            tags,
        });
        match recovered {
            Some(offset) => {
                group.set_offset(topic, offset);
                info!(group = group_id, topic, offset, "subscription restored from durable offset");
                Ok(SubscribeOutcome::Resubscribed {
                    replay_after: offset,
                })
            }
            None => {
                info!(group = group_id, topic, "subscribed");
                Ok(SubscribeOutcome::Subscribed)
            }
        }
    }

    /// Drop a group's topic subscription. Unknown groups or topics are
    /// logged and ignored.
    pub fn unsubscribe(&self, group_id: &str, topic: &str) -> Result<()> {
        match self.get(group_id) {
            Some(group) => {
                if group.remove_subscription(topic) {
                    info!(group = group_id, topic, "unsubscribed");
                } else {
                    warn!(group = group_id, topic, "unsubscribe for topic not subscribed");
                }
            }
            None => warn!(group = group_id, topic, "unsubscribe for unknown group"),
        }
        Ok(())
    }

    /// Add a consumer to a group, creating the group if needed
    pub fn join_group(&self, group_id: &str, consumer: ConsumerId) -> Result<()> {
        let group = self.get_or_create(group_id)?;
        group.add_consumer(consumer.clone());
        info!(group = group_id, consumer = %consumer, "consumer joined");
        Ok(())
    }

    /// Remove a consumer from a group; the group is destroyed when its
    /// last member leaves
    pub fn leave_group(&self, group_id: &str, consumer: &ConsumerId) -> Result<()> {
        match self.get(group_id) {
            Some(group) => {
                if group.remove_consumer(consumer) {
                    info!(group = group_id, consumer = %consumer, "consumer left");
                }
            }
            None => {
                warn!(group = group_id, consumer = %consumer, "leave for unknown group");
                return Ok(());
            }
        }
        self.collect_if_empty(group_id);
        Ok(())
    }

    /// Remove a disconnected consumer from every group it belongs to
    pub fn handle_disconnect(&self, consumer: &ConsumerId) {
        let member_of: Vec<String> = self
            .groups
            .iter()
            .filter(|entry| entry.value().has_consumer(consumer))
            .map(|entry| entry.key().clone())
            .collect();
        for group_id in member_of {
            if let Some(group) = self.get(&group_id) {
                group.remove_consumer(consumer);
                info!(group = %group_id, consumer = %consumer, "consumer removed on disconnect");
            }
            self.collect_if_empty(&group_id);
        }
    }

    /// The re-check inside `remove_if` runs under the shard lock, so a
    /// consumer joining concurrently keeps the group alive.
    fn collect_if_empty(&self, group_id: &str) {
        let removed = self
            .groups
            .remove_if(group_id, |_, group| group.is_empty())
            .is_some();
        if removed {
            info!(group = group_id, "empty consumer group destroyed");
        }
    }

    /// Groups whose subscriptions match the message, for delivery fanout
    pub fn groups_matching(&self, message: &Message) -> Vec<Arc<ConsumerGroup>> {
        self.groups
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .subscriptions
                    .iter()
                    .any(|s| s.value().matches(message))
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Advance a group's topic offset and persist it. The durable write
    /// runs off the delivery path; failures are logged, not surfaced.
    pub fn advance_offset(&self, group: &Arc<ConsumerGroup>, topic: &str, message_id: u64) {
        if !group.try_advance_offset(topic, message_id) {
            debug!(
                group = %group.group_id,
                topic,
                message_id,
                "offset not advanced (behind current)"
            );
            return;
        }
        let store = self.offset_store.clone();
        let group_id = group.group_id.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.record(&group_id, &topic, message_id) {
                warn!(group = %group_id, topic = %topic, message_id, error = %e, "offset record failed");
            }
        });
    }

    /// Number of live groups
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether no groups exist
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::connections::ConnectionRegistry;
    use crate::config::OffsetLogConfig;
    use crate::store::OffsetStore;
    use tempfile::TempDir;

    fn registry_in(dir: &TempDir) -> GroupRegistry {
        let store = OffsetStore::open(&OffsetLogConfig {
            dir: dir.path().to_path_buf(),
            max_file_bytes: 10 * 1024 * 1024,
            flush_interval_ms: 1_000,
        })
        .unwrap();
        GroupRegistry::new(Arc::new(store))
    }

    fn consumer(n: u64) -> ConsumerId {
        let conns = ConnectionRegistry::new();
        let mut id = conns.mint_id();
        for _ in 0..n {
            id = conns.mint_id();
        }
        id
    }

    #[test]
    fn groups_are_created_on_demand_and_destroyed_when_empty() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        let c = consumer(0);

        registry.join_group("G1", c.clone()).unwrap();
        assert!(registry.get("G1").is_some());

        registry.leave_group("G1", &c).unwrap();
        assert!(registry.get("G1").is_none());
    }

    #[test]
    fn group_survives_while_members_remain() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        let (a, b) = (consumer(0), consumer(1));

        registry.join_group("G1", a.clone()).unwrap();
        registry.join_group("G1", b.clone()).unwrap();
        registry.leave_group("G1", &a).unwrap();
        assert!(registry.get("G1").is_some());
        registry.leave_group("G1", &b).unwrap();
        assert!(registry.get("G1").is_none());
    }

    #[test]
    fn invalid_group_ids_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        for bad in ["", "a:b", "a|b", "a/b", "a\\b"] {
            assert!(
                matches!(
                    registry.get_or_create(bad),
                    Err(MurmurError::InvalidArgument(_))
                ),
                "expected rejection for {:?}",
                bad
            );
        }
    }

    #[test]
    fn subscribe_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        assert_eq!(
            registry.subscribe("G1", "orders", vec![]).unwrap(),
            SubscribeOutcome::Subscribed
        );
        assert_eq!(
            registry.subscribe("G1", "orders", vec![]).unwrap(),
            SubscribeOutcome::AlreadySubscribed
        );
    }

    #[test]
    fn subscribe_recovers_durable_offset() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        registry.offset_store.record("G1", "orders", 42).unwrap();
        registry.offset_store.flush_all().unwrap();

        let outcome = registry.subscribe("G1", "orders", vec![]).unwrap();
        assert_eq!(outcome, SubscribeOutcome::Resubscribed { replay_after: 42 });
        assert_eq!(registry.get("G1").unwrap().offset("orders"), 42);
    }

    #[test]
    fn unsubscribe_unknown_group_is_noop() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        assert!(registry.unsubscribe("ghost", "orders").is_ok());
    }

    #[test]
    fn disconnect_removes_from_all_groups() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        let (a, b) = (consumer(0), consumer(1));

        registry.join_group("G1", a.clone()).unwrap();
        registry.join_group("G2", a.clone()).unwrap();
        registry.join_group("G2", b.clone()).unwrap();

        registry.handle_disconnect(&a);
        assert!(registry.get("G1").is_none(), "G1 became empty");
        let g2 = registry.get("G2").unwrap();
        assert!(!g2.has_consumer(&a));
        assert!(g2.has_consumer(&b));
    }

    #[test]
    fn offset_only_moves_forward() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        registry.subscribe("G1", "orders", vec![]).unwrap();
        let group = registry.get("G1").unwrap();

        assert!(group.try_advance_offset("orders", 10));
        assert!(!group.try_advance_offset("orders", 7));
        assert!(!group.try_advance_offset("orders", 10));
        assert_eq!(group.offset("orders"), 10);
    }

    #[test]
    fn unsubscribe_clears_in_memory_offset_only() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        registry.offset_store.record("G1", "orders", 5).unwrap();
        registry.subscribe("G1", "orders", vec![]).unwrap();
        registry.unsubscribe("G1", "orders").unwrap();

        let group = registry.get_or_create("G1").unwrap();
        assert_eq!(group.offset("orders"), 0);
        // Resubscribe restores the durable record
        let outcome = registry.subscribe("G1", "orders", vec![]).unwrap();
        assert_eq!(outcome, SubscribeOutcome::Resubscribed { replay_after: 5 });
    }

    #[test]
    fn tag_filter_on_subscription() {
        let sub = Subscription {
            topic: "orders".into(),
            tags: vec!["vip".into()],
        };
        let mut msg = Message::durable("orders", "p");
        assert!(!sub.matches(&msg));
        msg.tags.push("vip".into());
        assert!(sub.matches(&msg));
        msg.topic = "billing".into();
        assert!(!sub.matches(&msg));
    }
}
