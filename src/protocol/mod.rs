//! Wire envelope and payload types
//!
//! Every frame on the wire is a newline-terminated UTF-8 JSON object with
//! a single envelope shape: `{isRequest, traceId, methodType, json}`. The
//! `json` field carries the method-specific payload, itself JSON-encoded.
//!
//! `methodType` stays a plain string in the envelope so that an unknown
//! method never fails envelope decoding — unknown methods are logged and
//! ignored, not answered with an error.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{MurmurError, Result};
use crate::message::Message;

/// Upper bound on a single wire frame (1 MiB)
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Dispatchable method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodType {
    /// Producer publishes a message
    ProducerSend,
    /// Broker confirms a producer send
    BrokerConfirm,
    /// Consumer group subscribes to a topic
    GroupSubscribe,
    /// Consumer group drops a topic subscription
    GroupUnsubscribe,
    /// Consumer joins a group
    ConsumerJoinGroup,
    /// Consumer leaves a group
    ConsumerLeaveGroup,
    /// Consumer acknowledges a delivery
    ConsumerAck,
    /// Broker pushes a message to a consumer
    BrokerPush,
    /// Broker answers a subscription-surface request
    SubscribeResponse,
}

impl MethodType {
    /// Wire name of this method
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodType::ProducerSend => "producer-send",
            MethodType::BrokerConfirm => "broker-confirm",
            MethodType::GroupSubscribe => "group-subscribe",
            MethodType::GroupUnsubscribe => "group-unsubscribe",
            MethodType::ConsumerJoinGroup => "consumer-join-group",
            MethodType::ConsumerLeaveGroup => "consumer-leave-group",
            MethodType::ConsumerAck => "consumer-ack",
            MethodType::BrokerPush => "broker-push",
            MethodType::SubscribeResponse => "subscribe-response",
        }
    }

    /// Parse a wire name; `None` for unknown methods
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "producer-send" => MethodType::ProducerSend,
            "broker-confirm" => MethodType::BrokerConfirm,
            "group-subscribe" => MethodType::GroupSubscribe,
            "group-unsubscribe" => MethodType::GroupUnsubscribe,
            "consumer-join-group" => MethodType::ConsumerJoinGroup,
            "consumer-leave-group" => MethodType::ConsumerLeaveGroup,
            "consumer-ack" => MethodType::ConsumerAck,
            "broker-push" => MethodType::BrokerPush,
            "subscribe-response" => MethodType::SubscribeResponse,
            _ => return None,
        })
    }
}

impl std::fmt::Display for MethodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single wire frame shape
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Whether this frame initiates a request (vs. responds to one)
    pub is_request: bool,
    /// Correlation id echoed by responses
    pub trace_id: String,
    /// Wire method name
    pub method_type: String,
    /// Method-specific payload, JSON-encoded
    pub json: String,
}

impl Envelope {
    /// Build a request envelope with a serialized payload
    pub fn request<P: Serialize>(
        trace_id: impl Into<String>,
        method: MethodType,
        payload: &P,
    ) -> Result<Self> {
        Ok(Self {
            is_request: true,
            trace_id: trace_id.into(),
            method_type: method.as_str().to_string(),
            json: serde_json::to_string(payload)?,
        })
    }

    /// Build a response envelope with a serialized payload
    pub fn response<P: Serialize>(
        trace_id: impl Into<String>,
        method: MethodType,
        payload: &P,
    ) -> Result<Self> {
        Ok(Self {
            is_request: false,
            trace_id: trace_id.into(),
            method_type: method.as_str().to_string(),
            json: serde_json::to_string(payload)?,
        })
    }

    /// Build an error response. The method type echoes the failed request
    /// when it was recognizable, otherwise it is left empty.
    pub fn error(trace_id: impl Into<String>, method_type: &str, detail: &str) -> Self {
        Self {
            is_request: false,
            trace_id: trace_id.into(),
            method_type: method_type.to_string(),
            json: format!("{{\"error\":{}}}", serde_json::Value::from(detail)),
        }
    }

    /// Decode one frame (without its trailing newline)
    pub fn decode(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim())
            .map_err(|e| MurmurError::Protocol(format!("malformed envelope: {}", e)))
    }

    /// Encode to a newline-terminated frame
    pub fn encode(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Resolve the method type; `None` for unknown methods
    pub fn method(&self) -> Option<MethodType> {
        MethodType::parse(&self.method_type)
    }

    /// Deserialize the payload
    pub fn payload<P: DeserializeOwned>(&self) -> Result<P> {
        serde_json::from_str(&self.json)
            .map_err(|e| MurmurError::Protocol(format!("malformed payload: {}", e)))
    }
}

/// Consumer acknowledgement status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckStatus {
    /// Message processed successfully; advances the group offset
    Success,
    /// Message processing failed; recorded for dedup but does not advance
    Fail,
}

impl Default for AckStatus {
    fn default() -> Self {
        AckStatus::Success
    }
}

// ── Payload DTOs ─────────────────────────────────────────────────────────

/// `producer-send` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSend {
    /// Producer-assigned, globally increasing message id
    pub message_id: u64,
    /// Version of the latch awaiting this attempt's confirm
    pub version: u64,
    /// The message itself
    pub message: Message,
}

/// `broker-confirm` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Confirm {
    /// Message id being confirmed
    pub message_id: u64,
    /// Latch version echoed from the send attempt
    pub version: u64,
}

/// `group-subscribe` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    /// Consumer group id
    pub group_id: String,
    /// Topic to subscribe to
    pub topic: String,
    /// Tag filter; empty means match all
    #[serde(default)]
    pub tags: Vec<String>,
}

/// `group-unsubscribe` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    /// Consumer group id
    pub group_id: String,
    /// Topic to drop
    pub topic: String,
}

/// `consumer-join-group` / `consumer-leave-group` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMembership {
    /// Consumer group id
    pub group_id: String,
}

/// `consumer-ack` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckRequest {
    /// Consumer group id
    pub group_id: String,
    /// Message id being acknowledged
    pub message_id: u64,
    /// Processing outcome
    #[serde(default)]
    pub status: AckStatus,
}

/// `broker-push` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Push {
    /// Message id (used by the consumer's ack)
    pub message_id: u64,
    /// Group the delivery targets
    pub group_id: String,
    /// The message itself
    pub message: Message,
}

/// `subscribe-response` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeResponse {
    /// Whether the request was applied
    pub ok: bool,
    /// Human-readable detail, empty on success
    #[serde(default)]
    pub detail: String,
}

impl SubscribeResponse {
    /// A successful, detail-free response
    pub fn ok() -> Self {
        Self {
            ok: true,
            detail: String::new(),
        }
    }

    /// A rejected response with a reason
    pub fn rejected(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
        }
    }
}
