//! Murmur — a single-node message broker
//!
//! Producers publish durable or transient messages to topics; consumer
//! groups receive load-balanced, at-least-once deliveries with explicit
//! acknowledgements and durable consumption offsets. Everything speaks a
//! newline-delimited JSON envelope protocol over TCP.
//!
//! The crate splits into the broker core (stores, group registry,
//! delivery router), the TCP server, and the producer/consumer clients.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod id;
pub mod message;
pub mod protocol;
pub mod server;
pub mod store;

pub use broker::{Broker, SharedBroker};
pub use client::{ConsumerClient, ProducerClient, SendReceipt};
pub use config::Config;
pub use error::{MurmurError, Result};
pub use id::IdGenerator;
pub use message::Message;
pub use server::Server;
