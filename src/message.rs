//! Message entity
//!
//! A message is immutable after ingest and owned exclusively by the
//! message store. Field names are camelCase on the wire.

use serde::{Deserialize, Serialize};

use crate::error::{MurmurError, Result};

/// A published message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Topic this message is published to
    pub topic: String,
    /// Tag list used by subscription filters
    #[serde(default)]
    pub tags: Vec<String>,
    /// Opaque message body
    pub payload: String,
    /// Business correlation key
    #[serde(default)]
    pub biz_key: String,
    /// Whether the broker persists this message to the segment log
    #[serde(default = "default_durable")]
    pub durable: bool,
}

fn default_durable() -> bool {
    true
}

impl Message {
    /// Build a durable message with no tags
    pub fn durable(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            tags: Vec::new(),
            payload: payload.into(),
            biz_key: String::new(),
            durable: true,
        }
    }

    /// Build a transient (memory-only) message with no tags
    pub fn transient(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            durable: false,
            ..Self::durable(topic, payload)
        }
    }

    /// Validate required fields at the ingest boundary
    pub fn validate(&self) -> Result<()> {
        if self.topic.is_empty() {
            return Err(MurmurError::InvalidArgument(
                "message topic must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Whether this message passes a subscription tag filter.
    /// An empty filter matches all tags.
    pub fn matches_tags(&self, filter: &[String]) -> bool {
        filter.is_empty() || self.tags.iter().any(|t| filter.contains(t))
    }
}
