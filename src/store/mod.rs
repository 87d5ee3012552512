//! Durable stores
//!
//! Two independent append-only stores back the broker: the message store
//! (segment log of ingested messages) and the offset store (per-group
//! consumption cursors). Each recovers from its own files at startup,
//! before the broker accepts connections.

pub mod message;
pub mod offset;

pub use message::{MessageStore, RecoveryReport, SharedMessageStore};
pub use offset::{OffsetStore, SharedOffsetStore};
