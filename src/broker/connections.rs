//! Consumer connection registry
//!
//! Maps broker-minted consumer identities to the outbound write handle of
//! their TCP connection. Identity is assigned at accept time and never
//! reused within a process lifetime; group membership elsewhere refers to
//! consumers only through these ids.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Opaque identity of one connected consumer
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConsumerId(String);

impl ConsumerId {
    /// View as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry of live consumer connections and their outbound channels
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConsumerId, mpsc::UnboundedSender<String>>,
    next_seq: AtomicU64,
}

/// Shared handle to a [`ConnectionRegistry`]
pub type SharedConnectionRegistry = Arc<ConnectionRegistry>;

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh consumer identity for a newly accepted connection
    pub fn mint_id(&self) -> ConsumerId {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        ConsumerId(format!("conn-{}", seq))
    }

    /// Attach an outbound frame channel to a consumer identity
    pub fn register(&self, id: ConsumerId, outbound: mpsc::UnboundedSender<String>) {
        debug!(consumer = %id, "connection registered");
        self.connections.insert(id, outbound);
    }

    /// Detach a consumer's channel; called once on disconnect
    pub fn deregister(&self, id: &ConsumerId) {
        debug!(consumer = %id, "connection deregistered");
        self.connections.remove(id);
    }

    /// Queue a frame for the consumer's writer task. Returns false when
    /// the consumer is gone or its writer has shut down.
    pub fn send(&self, id: &ConsumerId, frame: String) -> bool {
        match self.connections.get(id) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Whether the consumer still has a live connection
    pub fn is_active(&self, id: &ConsumerId) -> bool {
        self.connections.contains_key(id)
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no consumers are connected
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_are_unique() {
        let registry = ConnectionRegistry::new();
        let a = registry.mint_id();
        let b = registry.mint_id();
        assert_ne!(a, b);
    }

    #[test]
    fn send_routes_to_registered_channel() {
        let registry = ConnectionRegistry::new();
        let id = registry.mint_id();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(id.clone(), tx);

        assert!(registry.send(&id, "frame\n".into()));
        assert_eq!(rx.try_recv().unwrap(), "frame\n");
    }

    #[test]
    fn send_to_unknown_or_deregistered_fails() {
        let registry = ConnectionRegistry::new();
        let id = registry.mint_id();
        assert!(!registry.send(&id, "x".into()));

        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(id.clone(), tx);
        assert!(registry.is_active(&id));
        registry.deregister(&id);
        assert!(!registry.is_active(&id));
        assert!(!registry.send(&id, "x".into()));
    }
}
