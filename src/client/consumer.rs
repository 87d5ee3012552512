//! Consumer client
//!
//! Joins groups, manages subscriptions, streams broker pushes, and sends
//! acknowledgements. Request/response surfaces (join, subscribe, …) are
//! correlated by trace id through a pending-response table; pushes flow
//! into a channel drained by [`ConsumerClient::recv`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ConsumerConfig;
use crate::error::{MurmurError, Result};
use crate::protocol::{
    AckRequest, AckStatus, Envelope, GroupMembership, MethodType, Push, SubscribeRequest,
    SubscribeResponse, UnsubscribeRequest,
};
use crate::server::LineReader;

/// Async consumer over one broker connection
pub struct ConsumerClient {
    config: ConsumerConfig,
    outbound: mpsc::UnboundedSender<String>,
    pending: Arc<DashMap<String, oneshot::Sender<Envelope>>>,
    pushes: mpsc::UnboundedReceiver<Push>,
    next_trace: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ConsumerClient {
    /// Connect to the broker
    pub async fn connect(addr: &str, config: ConsumerConfig) -> Result<Self> {
        let stream = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| MurmurError::Connection(format!("connect to {} timed out", addr)))??;
        let (read_half, mut write_half) = stream.into_split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if write_half.write_all(frame.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let pending: Arc<DashMap<String, oneshot::Sender<Envelope>>> = Arc::new(DashMap::new());
        let (push_tx, pushes) = mpsc::unbounded_channel::<Push>();
        let reader = {
            let pending = pending.clone();
            tokio::spawn(async move {
                let mut reader = LineReader::new(read_half);
                loop {
                    let line = match reader.read_line().await {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(e) => {
                            debug!(error = %e, "consumer reader stopped");
                            break;
                        }
                    };
                    let Ok(envelope) = Envelope::decode(&line) else {
                        warn!("malformed frame from broker ignored");
                        continue;
                    };
                    match envelope.method() {
                        Some(MethodType::BrokerPush) => match envelope.payload::<Push>() {
                            Ok(push) => {
                                if push_tx.send(push).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "malformed push ignored"),
                        },
                        _ => {
                            // Request/response surface: route to the waiter
                            if let Some((_, tx)) = pending.remove(&envelope.trace_id) {
                                let _ = tx.send(envelope);
                            }
                        }
                    }
                }
            })
        };

        Ok(Self {
            config,
            outbound,
            pending,
            pushes,
            next_trace: AtomicU64::new(0),
            reader,
            writer,
        })
    }

    /// Join a consumer group, becoming eligible for deliveries to it
    pub async fn join_group(&self, group_id: &str) -> Result<()> {
        let payload = GroupMembership {
            group_id: group_id.to_string(),
        };
        self.request(MethodType::ConsumerJoinGroup, &payload).await
    }

    /// Leave a consumer group
    pub async fn leave_group(&self, group_id: &str) -> Result<()> {
        let payload = GroupMembership {
            group_id: group_id.to_string(),
        };
        self.request(MethodType::ConsumerLeaveGroup, &payload).await
    }

    /// Subscribe a group to a topic with an optional tag filter
    pub async fn subscribe(&self, group_id: &str, topic: &str, tags: Vec<String>) -> Result<()> {
        let payload = SubscribeRequest {
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            tags,
        };
        self.request(MethodType::GroupSubscribe, &payload).await
    }

    /// Drop a group's topic subscription
    pub async fn unsubscribe(&self, group_id: &str, topic: &str) -> Result<()> {
        let payload = UnsubscribeRequest {
            group_id: group_id.to_string(),
            topic: topic.to_string(),
        };
        self.request(MethodType::GroupUnsubscribe, &payload).await
    }

    /// Acknowledge a delivered message. Fire-and-forget; the broker sends
    /// no response to acks.
    pub fn ack(&self, group_id: &str, message_id: u64, status: AckStatus) -> Result<()> {
        let payload = AckRequest {
            group_id: group_id.to_string(),
            message_id,
            status,
        };
        let trace = self.mint_trace();
        let envelope = Envelope::request(trace, MethodType::ConsumerAck, &payload)?;
        self.outbound
            .send(envelope.encode()?)
            .map_err(|_| MurmurError::ConnectionClosed)
    }

    /// Receive the next pushed message. `None` once the connection and
    /// all buffered pushes are gone.
    pub async fn recv(&mut self) -> Option<Push> {
        self.pushes.recv().await
    }

    async fn request<P: serde::Serialize>(&self, method: MethodType, payload: &P) -> Result<()> {
        let trace = self.mint_trace();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(trace.clone(), tx);

        let envelope = Envelope::request(&*trace, method, payload)?;
        if self.outbound.send(envelope.encode()?).is_err() {
            self.pending.remove(&trace);
            return Err(MurmurError::ConnectionClosed);
        }

        let reply = tokio::time::timeout(self.config.connect_timeout(), rx)
            .await
            .map_err(|_| {
                self.pending.remove(&trace);
                MurmurError::Connection(format!("{} request timed out", method))
            })?
            .map_err(|_| MurmurError::ConnectionClosed)?;

        let response: SubscribeResponse = reply.payload()?;
        if response.ok {
            Ok(())
        } else {
            Err(MurmurError::InvalidArgument(response.detail))
        }
    }

    fn mint_trace(&self) -> String {
        format!("c-{}", self.next_trace.fetch_add(1, Ordering::Relaxed))
    }
}

impl Drop for ConsumerClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
