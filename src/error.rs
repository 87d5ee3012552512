//! Error types for Murmur
//!
//! This module defines the single error type used throughout the codebase.
//! Uses `thiserror` for ergonomic error definitions.

use std::io;
use thiserror::Error;

/// Main error type for Murmur operations
#[derive(Error, Debug)]
pub enum MurmurError {
    /// Wire envelope parsing or framing error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid argument value or format
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Append-only log write or read error
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Configuration parsing or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection was closed by the peer
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection-related error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Producer gave up after exhausting its retry budget
    #[error("Send failed after {attempts} attempts (last trace id {trace_id})")]
    SendExhausted {
        /// Number of send attempts made before giving up
        attempts: u32,
        /// Trace id of the final attempt
        trace_id: String,
    },

    /// Id generation error (clock regression or exhausted parameters)
    #[error("Id generation error: {0}")]
    IdGeneration(String),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON encode/decode error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for Murmur operations
pub type Result<T> = std::result::Result<T, MurmurError>;

impl MurmurError {
    /// Returns true if this error should close the connection it occurred on
    #[cold]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MurmurError::Io(_) | MurmurError::ConnectionClosed | MurmurError::Connection(_)
        )
    }
}
