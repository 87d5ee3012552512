//! Delivery router
//!
//! Fans each ingested message out to every subscribed group, picks one
//! online member per group deterministically, and pushes the message over
//! that member's connection. Push is single-attempt: a failed or dropped
//! push is logged and the message waits for the group's next catch-up
//! replay rather than being reassigned.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::broker::connections::{ConsumerId, SharedConnectionRegistry};
use crate::broker::registry::{ConsumerGroup, SharedGroupRegistry};
use crate::error::Result;
use crate::id::IdGenerator;
use crate::message::Message;
use crate::protocol::{AckStatus, Envelope, MethodType, Push};
use crate::store::SharedMessageStore;

/// Routes messages from the store to consumer connections
pub struct DeliveryRouter {
    registry: SharedGroupRegistry,
    store: SharedMessageStore,
    connections: SharedConnectionRegistry,
    /// (message id, consumer id) pairs already acknowledged; repeat acks
    /// are absorbed here
    acks: DashMap<(u64, ConsumerId), AckStatus>,
    id_gen: Arc<IdGenerator>,
}

/// Shared handle to a [`DeliveryRouter`]
pub type SharedDeliveryRouter = Arc<DeliveryRouter>;

impl DeliveryRouter {
    /// Wire the router to its collaborators
    pub fn new(
        registry: SharedGroupRegistry,
        store: SharedMessageStore,
        connections: SharedConnectionRegistry,
        id_gen: Arc<IdGenerator>,
    ) -> Self {
        Self {
            registry,
            store,
            connections,
            acks: DashMap::new(),
            id_gen,
        }
    }

    /// Fan a freshly ingested message out to every matching group
    pub fn on_new_message(&self, message_id: u64, message: &Message) {
        for group in self.registry.groups_matching(message) {
            self.deliver_to_group(&group, message_id, message);
        }
    }

    /// Deliver one message to one group: skip if the group has already
    /// consumed past it, pick the target member by id modulo the sorted
    /// online count, and push once.
    fn deliver_to_group(&self, group: &Arc<ConsumerGroup>, message_id: u64, message: &Message) {
        if group.offset(&message.topic) >= message_id {
            debug!(
                group = %group.group_id,
                message_id,
                "skipping delivery; group offset already past message"
            );
            return;
        }

        let members = group.sorted_consumer_ids();
        if members.is_empty() {
            debug!(group = %group.group_id, message_id, "no online consumers; delivery deferred");
            return;
        }
        let target = &members[(message_id % members.len() as u64) as usize];

        if self.acks.contains_key(&(message_id, target.clone())) {
            debug!(
                group = %group.group_id,
                consumer = %target,
                message_id,
                "skipping push; consumer already acknowledged"
            );
            return;
        }

        if let Err(e) = self.push(group, target, message_id, message) {
            warn!(
                group = %group.group_id,
                consumer = %target,
                message_id,
                error = %e,
                "push failed; no reassignment"
            );
        }
    }

    fn push(
        &self,
        group: &Arc<ConsumerGroup>,
        target: &ConsumerId,
        message_id: u64,
        message: &Message,
    ) -> Result<()> {
        let payload = Push {
            message_id,
            group_id: group.group_id.clone(),
            message: message.clone(),
        };
        let trace_id = self.id_gen.next_id()?.to_string();
        let envelope = Envelope::request(trace_id, MethodType::BrokerPush, &payload)?;
        let frame = envelope.encode()?;
        if self.connections.send(target, frame) {
            debug!(group = %group.group_id, consumer = %target, message_id, "message pushed");
        } else {
            warn!(
                group = %group.group_id,
                consumer = %target,
                message_id,
                "push dropped; consumer connection gone, no reassignment"
            );
        }
        Ok(())
    }

    /// Process a consumer acknowledgement. Unknown message ids are logged
    /// and absorbed. A SUCCESS ack advances the group's offset for the
    /// topic the stored message belongs to; a FAIL ack only records the
    /// (message, consumer) pair for dedup.
    pub fn on_ack(
        &self,
        group_id: &str,
        consumer: &ConsumerId,
        message_id: u64,
        status: AckStatus,
    ) {
        let Some(message) = self.store.get(message_id) else {
            warn!(group = group_id, message_id, "ack for unknown message ignored");
            return;
        };
        let first = self
            .acks
            .insert((message_id, consumer.clone()), status)
            .is_none();
        if !first {
            debug!(group = group_id, consumer = %consumer, message_id, "repeat ack absorbed");
            return;
        }
        debug!(group = group_id, consumer = %consumer, message_id, ?status, "ack recorded");

        if status == AckStatus::Success {
            match self.registry.get(group_id) {
                Some(group) => self.registry.advance_offset(&group, &message.topic, message_id),
                None => warn!(group = group_id, message_id, "ack for unknown group"),
            }
        }
    }

    /// Replay stored messages on `topic` with ids greater than `after` to
    /// the group, through the normal per-message delivery path.
    pub fn replay_to_group(&self, group_id: &str, topic: &str, after: u64) {
        let Some(group) = self.registry.get(group_id) else {
            return;
        };
        let backlog = self.store.topic_messages_after(topic, after);
        if backlog.is_empty() {
            return;
        }
        debug!(group = group_id, topic, after, count = backlog.len(), "replaying backlog");
        for (message_id, message) in backlog {
            self.deliver_to_group(&group, message_id, &message);
        }
    }

    /// Whether the (message, consumer) pair has been acknowledged
    pub fn is_acked(&self, message_id: u64, consumer: &ConsumerId) -> bool {
        self.acks.contains_key(&(message_id, consumer.clone()))
    }
}
