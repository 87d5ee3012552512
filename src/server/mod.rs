//! TCP server
//!
//! Accepts producer and consumer connections and speaks the
//! newline-delimited JSON envelope protocol. Split into the listener
//! (accept loop), the per-connection plumbing (framing, writer task,
//! lifecycle), and the request handler (method dispatch).

pub mod connection;
pub mod handler;
pub mod listener;

pub use connection::LineReader;
pub use listener::Server;
