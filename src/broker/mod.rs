//! Broker core
//!
//! Wires the stores, the group registry, the connection registry and the
//! delivery router together behind one facade. The server layer talks
//! only to this type; the registry and router never hold references to
//! each other — subscribe returns an outcome and the facade drives the
//! catch-up replay it implies.

pub mod connections;
pub mod registry;
pub mod router;

use std::sync::Arc;

use tracing::info;

pub use connections::{ConnectionRegistry, ConsumerId, SharedConnectionRegistry};
pub use registry::{ConsumerGroup, GroupRegistry, SharedGroupRegistry, SubscribeOutcome};
pub use router::{DeliveryRouter, SharedDeliveryRouter};

use crate::config::Config;
use crate::error::Result;
use crate::id::IdGenerator;
use crate::message::Message;
use crate::protocol::AckStatus;
use crate::store::{MessageStore, OffsetStore, SharedMessageStore, SharedOffsetStore};

/// The assembled single-node broker
pub struct Broker {
    config: Config,
    store: SharedMessageStore,
    offsets: SharedOffsetStore,
    registry: SharedGroupRegistry,
    router: SharedDeliveryRouter,
    connections: SharedConnectionRegistry,
    id_gen: Arc<IdGenerator>,
}

/// Shared handle to a [`Broker`]
pub type SharedBroker = Arc<Broker>;

impl Broker {
    /// Open both stores, run recovery to completion, and assemble the
    /// broker. Any failure here aborts startup.
    pub fn open(config: Config) -> Result<Self> {
        let store = Arc::new(MessageStore::open(&config.message_log)?);
        let report = store.recover()?;
        info!(
            recovered = report.recovered,
            failed = report.failed,
            "message log recovered"
        );

        let offsets = Arc::new(OffsetStore::open(&config.offset_log)?);
        let restored = offsets.recover_all()?;
        info!(groups = restored.len(), "offset log recovered");

        let registry = Arc::new(GroupRegistry::new(offsets.clone()));
        let connections = Arc::new(ConnectionRegistry::new());
        let id_gen = Arc::new(IdGenerator::new(
            config.id.worker_id,
            config.id.datacenter_id,
        )?);
        let router = Arc::new(DeliveryRouter::new(
            registry.clone(),
            store.clone(),
            connections.clone(),
            id_gen.clone(),
        ));

        Ok(Self {
            config,
            store,
            offsets,
            registry,
            router,
            connections,
            id_gen,
        })
    }

    /// Spawn the periodic offset flush task
    pub fn start_offset_flush(&self) -> tokio::task::JoinHandle<()> {
        OffsetStore::spawn_flush_task(self.offsets.clone(), self.config.offset_log.flush_interval())
    }

    /// Ingest a producer message and fan it out. Persistence (for durable
    /// messages) happens before any push; delivery runs synchronously so
    /// the confirm sent after this call implies the message was routed.
    pub fn publish(&self, message_id: u64, message: Message) -> Result<()> {
        message.validate()?;
        self.store.ingest(message_id, message.clone());
        self.router.on_new_message(message_id, &message);
        Ok(())
    }

    /// Subscribe a group to a topic; when the subscription restores a
    /// durable offset, replay the backlog past it
    pub fn subscribe(&self, group_id: &str, topic: &str, tags: Vec<String>) -> Result<()> {
        match self.registry.subscribe(group_id, topic, tags)? {
            SubscribeOutcome::Resubscribed { replay_after } => {
                self.router.replay_to_group(group_id, topic, replay_after);
            }
            SubscribeOutcome::Subscribed | SubscribeOutcome::AlreadySubscribed => {}
        }
        Ok(())
    }

    /// Drop a group's topic subscription
    pub fn unsubscribe(&self, group_id: &str, topic: &str) -> Result<()> {
        self.registry.unsubscribe(group_id, topic)
    }

    /// Add a consumer to a group
    pub fn join_group(&self, group_id: &str, consumer: ConsumerId) -> Result<()> {
        self.registry.join_group(group_id, consumer)
    }

    /// Remove a consumer from a group
    pub fn leave_group(&self, group_id: &str, consumer: &ConsumerId) -> Result<()> {
        self.registry.leave_group(group_id, consumer)
    }

    /// Process a consumer acknowledgement
    pub fn ack(&self, group_id: &str, consumer: &ConsumerId, message_id: u64, status: AckStatus) {
        self.router.on_ack(group_id, consumer, message_id, status);
    }

    /// Remove a disconnected consumer from the connection registry and
    /// every group it belonged to
    pub fn handle_disconnect(&self, consumer: &ConsumerId) {
        self.connections.deregister(consumer);
        self.registry.handle_disconnect(consumer);
    }

    /// Broker configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Live consumer connections
    pub fn connections(&self) -> &SharedConnectionRegistry {
        &self.connections
    }

    /// Consumer group registry
    pub fn registry(&self) -> &SharedGroupRegistry {
        &self.registry
    }

    /// Message store
    pub fn store(&self) -> &SharedMessageStore {
        &self.store
    }

    /// Offset store
    pub fn offsets(&self) -> &SharedOffsetStore {
        &self.offsets
    }

    /// Broker-side id generator (used for push trace ids)
    pub fn id_gen(&self) -> &Arc<IdGenerator> {
        &self.id_gen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MessageLogConfig, OffsetLogConfig};
    use crate::protocol::{Envelope, Push};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn broker_in(msg_dir: &TempDir, off_dir: &TempDir) -> Broker {
        let config = Config {
            message_log: MessageLogConfig {
                dir: msg_dir.path().to_path_buf(),
                ..Default::default()
            },
            offset_log: OffsetLogConfig {
                dir: off_dir.path().to_path_buf(),
                ..Default::default()
            },
            ..Default::default()
        };
        Broker::open(config).unwrap()
    }

    fn attach(broker: &Broker, group: &str) -> (ConsumerId, mpsc::UnboundedReceiver<String>) {
        let id = broker.connections().mint_id();
        let (tx, rx) = mpsc::unbounded_channel();
        broker.connections().register(id.clone(), tx);
        broker.join_group(group, id.clone()).unwrap();
        (id, rx)
    }

    fn push_ids(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<u64> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|frame| {
                let push: Push = Envelope::decode(&frame).unwrap().payload().unwrap();
                push.message_id
            })
            .collect()
    }

    #[test]
    fn publish_reaches_subscribed_group() {
        let (m, o) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let broker = broker_in(&m, &o);
        broker.subscribe("G1", "orders", vec![]).unwrap();
        let (_, mut rx) = attach(&broker, "G1");

        broker.publish(1, Message::durable("orders", "p")).unwrap();
        assert_eq!(push_ids(&mut rx), vec![1]);
    }

    #[test]
    fn publish_rejects_invalid_message() {
        let (m, o) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let broker = broker_in(&m, &o);
        assert!(broker.publish(1, Message::durable("", "p")).is_err());
    }

    #[tokio::test]
    async fn resubscribe_replays_only_past_the_durable_offset() {
        let (m, o) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        {
            let broker = broker_in(&m, &o);
            broker.subscribe("G1", "orders", vec![]).unwrap();
            let (consumer, _rx) = attach(&broker, "G1");
            for id in 1..=5u64 {
                broker.publish(id, Message::durable("orders", format!("m{}", id))).unwrap();
            }
            broker.ack("G1", &consumer, 3, AckStatus::Success);
            // Let the spawned offset write land, then flush
            tokio::task::yield_now().await;
            broker.offsets().flush_all().unwrap();
        }

        // Cold restart over the same directories
        let broker = broker_in(&m, &o);
        let (_, mut rx) = attach(&broker, "G1");
        broker.subscribe("G1", "orders", vec![]).unwrap();
        assert_eq!(push_ids(&mut rx), vec![4, 5]);
    }

    #[test]
    fn disconnect_cleans_up_everywhere() {
        let (m, o) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let broker = broker_in(&m, &o);
        broker.subscribe("G1", "orders", vec![]).unwrap();
        let (consumer, _rx) = attach(&broker, "G1");

        broker.handle_disconnect(&consumer);
        assert!(!broker.connections().is_active(&consumer));
        assert!(broker.registry().get("G1").is_none());
    }
}
