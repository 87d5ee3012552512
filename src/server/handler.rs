//! Request handler
//!
//! Dispatches decoded envelopes to broker operations. Malformed frames
//! and payloads get an error response without closing the connection;
//! unknown methods are logged and ignored. The only error surfaced to the
//! connection loop is a dead outbound channel.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broker::{ConsumerId, SharedBroker};
use crate::error::{MurmurError, Result};
use crate::protocol::{
    AckRequest, Confirm, Envelope, GroupMembership, MethodType, ProducerSend, SubscribeRequest,
    SubscribeResponse, UnsubscribeRequest,
};

/// Per-connection request dispatcher
pub struct Handler {
    broker: SharedBroker,
    consumer_id: ConsumerId,
    outbound: mpsc::UnboundedSender<String>,
}

impl Handler {
    /// Bind a handler to one connection's identity and writer channel
    pub fn new(
        broker: SharedBroker,
        consumer_id: ConsumerId,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            broker,
            consumer_id,
            outbound,
        }
    }

    /// Handle one frame. Returns an error only when the outbound channel
    /// is gone; every protocol-level failure is answered or ignored.
    pub fn handle_line(&self, line: &str) -> Result<()> {
        if line.trim().is_empty() {
            return Ok(());
        }
        let envelope = match Envelope::decode(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(consumer = %self.consumer_id, error = %e, "malformed envelope");
                return self.reply(Envelope::error("", "", &e.to_string()));
            }
        };

        let Some(method) = envelope.method() else {
            warn!(
                consumer = %self.consumer_id,
                method = %envelope.method_type,
                "unknown method ignored"
            );
            return Ok(());
        };

        match method {
            MethodType::ProducerSend => self.on_producer_send(&envelope),
            MethodType::GroupSubscribe => self.on_subscribe(&envelope),
            MethodType::GroupUnsubscribe => self.on_unsubscribe(&envelope),
            MethodType::ConsumerJoinGroup => self.on_join(&envelope),
            MethodType::ConsumerLeaveGroup => self.on_leave(&envelope),
            MethodType::ConsumerAck => self.on_ack(&envelope),
            // Broker-originated methods arriving from a peer
            MethodType::BrokerConfirm | MethodType::BrokerPush | MethodType::SubscribeResponse => {
                warn!(
                    consumer = %self.consumer_id,
                    method = %method,
                    "broker-originated method from peer ignored"
                );
                Ok(())
            }
        }
    }

    fn on_producer_send(&self, envelope: &Envelope) -> Result<()> {
        let send: ProducerSend = match envelope.payload() {
            Ok(p) => p,
            Err(e) => return self.reply_error(envelope, &e),
        };
        match self.broker.publish(send.message_id, send.message) {
            Ok(()) => {
                let confirm = Confirm {
                    message_id: send.message_id,
                    version: send.version,
                };
                let response =
                    Envelope::response(&*envelope.trace_id, MethodType::BrokerConfirm, &confirm)?;
                self.reply(response)
            }
            Err(e) => {
                warn!(
                    consumer = %self.consumer_id,
                    message_id = send.message_id,
                    error = %e,
                    "publish rejected"
                );
                self.reply_error(envelope, &e)
            }
        }
    }

    fn on_subscribe(&self, envelope: &Envelope) -> Result<()> {
        let req: SubscribeRequest = match envelope.payload() {
            Ok(p) => p,
            Err(e) => return self.reply_error(envelope, &e),
        };
        let outcome = self.broker.subscribe(&req.group_id, &req.topic, req.tags);
        self.reply_subscribe_surface(envelope, outcome)
    }

    fn on_unsubscribe(&self, envelope: &Envelope) -> Result<()> {
        let req: UnsubscribeRequest = match envelope.payload() {
            Ok(p) => p,
            Err(e) => return self.reply_error(envelope, &e),
        };
        let outcome = self.broker.unsubscribe(&req.group_id, &req.topic);
        self.reply_subscribe_surface(envelope, outcome)
    }

    fn on_join(&self, envelope: &Envelope) -> Result<()> {
        let req: GroupMembership = match envelope.payload() {
            Ok(p) => p,
            Err(e) => return self.reply_error(envelope, &e),
        };
        let outcome = self.broker.join_group(&req.group_id, self.consumer_id.clone());
        self.reply_subscribe_surface(envelope, outcome)
    }

    fn on_leave(&self, envelope: &Envelope) -> Result<()> {
        let req: GroupMembership = match envelope.payload() {
            Ok(p) => p,
            Err(e) => return self.reply_error(envelope, &e),
        };
        let outcome = self.broker.leave_group(&req.group_id, &self.consumer_id);
        self.reply_subscribe_surface(envelope, outcome)
    }

    /// Acks are fire-and-forget; no response frame
    fn on_ack(&self, envelope: &Envelope) -> Result<()> {
        let ack: AckRequest = match envelope.payload() {
            Ok(p) => p,
            Err(e) => return self.reply_error(envelope, &e),
        };
        debug!(
            consumer = %self.consumer_id,
            group = %ack.group_id,
            message_id = ack.message_id,
            "ack received"
        );
        self.broker
            .ack(&ack.group_id, &self.consumer_id, ack.message_id, ack.status);
        Ok(())
    }

    fn reply_subscribe_surface(
        &self,
        envelope: &Envelope,
        outcome: Result<()>,
    ) -> Result<()> {
        let payload = match outcome {
            Ok(()) => SubscribeResponse::ok(),
            Err(e) => {
                warn!(
                    consumer = %self.consumer_id,
                    method = %envelope.method_type,
                    error = %e,
                    "request rejected"
                );
                SubscribeResponse::rejected(e.to_string())
            }
        };
        let response =
            Envelope::response(&*envelope.trace_id, MethodType::SubscribeResponse, &payload)?;
        self.reply(response)
    }

    fn reply_error(&self, envelope: &Envelope, error: &MurmurError) -> Result<()> {
        self.reply(Envelope::error(
            &*envelope.trace_id,
            &envelope.method_type,
            &error.to_string(),
        ))
    }

    fn reply(&self, envelope: Envelope) -> Result<()> {
        let frame = envelope.encode()?;
        self.outbound
            .send(frame)
            .map_err(|_| MurmurError::ConnectionClosed)
    }
}
