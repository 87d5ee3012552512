//! Producer reliability client
//!
//! Sends messages and waits for broker confirms through a versioned
//! latch. Each logical send retries up to the configured limit, waiting
//! `coefficient * 2^attempt` ms per attempt; the message id (and the
//! trace id derived from it) stays fixed across attempts so the broker
//! ingests duplicates idempotently by id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::VersionedLatch;
use crate::config::ProducerConfig;
use crate::error::{MurmurError, Result};
use crate::id::IdGenerator;
use crate::message::Message;
use crate::protocol::{Confirm, Envelope, MethodType, ProducerSend};
use crate::server::LineReader;

/// Proof of a confirmed send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// Broker-visible message id
    pub message_id: u64,
    /// Trace id the send was correlated under
    pub trace_id: String,
}

/// Async producer with confirm-or-retry semantics
pub struct ProducerClient {
    config: ProducerConfig,
    id_gen: Arc<IdGenerator>,
    outbound: mpsc::UnboundedSender<String>,
    latches: Arc<DashMap<u64, Arc<VersionedLatch>>>,
    confirmed: DashMap<u64, Message>,
    next_version: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ProducerClient {
    /// Connect to the broker. The id generator is injected so multiple
    /// producers in one process can share a worker identity.
    pub async fn connect(
        addr: &str,
        config: ProducerConfig,
        id_gen: Arc<IdGenerator>,
    ) -> Result<Self> {
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

        let latches: Arc<DashMap<u64, Arc<VersionedLatch>>> = Arc::new(DashMap::new());
        let reader = {
            let latches = latches.clone();
            tokio::spawn(async move {
                let mut reader = LineReader::new(read_half);
                loop {
                    let line = match reader.read_line().await {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(e) => {
                            debug!(error = %e, "producer reader stopped");
                            break;
                        }
                    };
                    let Ok(envelope) = Envelope::decode(&line) else {
                        warn!("malformed frame from broker ignored");
                        continue;
                    };
                    if envelope.method() != Some(MethodType::BrokerConfirm) {
                        continue;
                    }
                    match envelope.payload::<Confirm>() {
                        Ok(confirm) => {
                            if let Some(latch) = latches.get(&confirm.message_id) {
                                latch.count_down(confirm.version);
                            }
                        }
                        Err(e) => warn!(error = %e, "malformed confirm ignored"),
                    }
                }
            })
        };

        Ok(Self {
            config,
            id_gen,
            outbound,
            latches,
            confirmed: DashMap::new(),
            next_version: AtomicU64::new(0),
            reader,
            writer,
        })
    }

    /// Send one message and wait for the broker's confirm, retrying with
    /// exponential backoff. Fails with `SendExhausted` after the retry
    /// budget; the error carries the trace id for log correlation.
    pub async fn send(&self, message: Message) -> Result<SendReceipt> {
        message.validate()?;
        let message_id = self.id_gen.next_id()?;
        let trace_id = message_id.to_string();

        for attempt in 0..self.config.retry_limit {
            let version = self.next_version.fetch_add(1, Ordering::Relaxed) + 1;
            let latch = Arc::new(VersionedLatch::new(version, 1));
            self.latches.insert(message_id, latch.clone());

            let payload = ProducerSend {
                message_id,
                version,
                message: message.clone(),
            };
            let envelope = Envelope::request(&*trace_id, MethodType::ProducerSend, &payload)?;
            if self.outbound.send(envelope.encode()?).is_err() {
                self.latches.remove(&message_id);
                return Err(MurmurError::ConnectionClosed);
            }

            let wait = backoff(self.config.backoff_coefficient_ms, attempt);
            if latch.wait(wait).await {
                self.latches.remove(&message_id);
                self.confirmed.insert(message_id, message);
                debug!(message_id, attempt, "send confirmed");
                return Ok(SendReceipt {
                    message_id,
                    trace_id,
                });
            }
            warn!(message_id, attempt, waited_ms = wait.as_millis() as u64, "confirm timed out");
        }

        self.latches.remove(&message_id);
        Err(MurmurError::SendExhausted {
            attempts: self.config.retry_limit,
            trace_id,
        })
    }

    /// Whether this client has received a confirm for the message id
    pub fn is_confirmed(&self, message_id: u64) -> bool {
        self.confirmed.contains_key(&message_id)
    }
}

/// Wait `coefficient * 2^attempt` ms, saturating instead of overflowing
/// for retry limits large enough to shift past 64 bits.
fn backoff(coefficient_ms: u64, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    Duration::from_millis(coefficient_ms.saturating_mul(factor))
}

impl Drop for ProducerClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff(500, 0), Duration::from_millis(500));
        assert_eq!(backoff(500, 1), Duration::from_millis(1_000));
        assert_eq!(backoff(500, 2), Duration::from_millis(2_000));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        assert_eq!(backoff(500, 64), Duration::from_millis(u64::MAX));
        assert_eq!(backoff(u64::MAX, 1), Duration::from_millis(u64::MAX));
        assert_eq!(backoff(0, 200), Duration::from_millis(0));
    }
}
