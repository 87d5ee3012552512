//! Per-connection plumbing
//!
//! Each accepted socket gets a broker-minted consumer identity, a reader
//! loop that frames newline-delimited envelopes, and a dedicated writer
//! task fed through an unbounded channel. Pushes and responses both go
//! through the writer task, so the socket is never written from two
//! places at once.

use std::net::SocketAddr;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broker::SharedBroker;
use crate::error::{MurmurError, Result};
use crate::protocol::MAX_FRAME_BYTES;
use crate::server::handler::Handler;

/// Reads newline-terminated frames from a byte stream, enforcing the
/// frame size cap
pub struct LineReader<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Wrap a byte stream
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Read the next frame, without its trailing newline. `Ok(None)`
    /// means the peer closed cleanly at a frame boundary; EOF mid-frame
    /// is an error.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                if pos > MAX_FRAME_BYTES {
                    return Err(MurmurError::Protocol(format!(
                        "frame exceeds {} byte limit",
                        MAX_FRAME_BYTES
                    )));
                }
                let frame = self.buf.split_to(pos + 1);
                let line = std::str::from_utf8(&frame[..pos])
                    .map_err(|_| MurmurError::Protocol("frame is not valid UTF-8".into()))?
                    .to_string();
                return Ok(Some(line));
            }
            if self.buf.len() > MAX_FRAME_BYTES {
                return Err(MurmurError::Protocol(format!(
                    "frame exceeds {} byte limit",
                    MAX_FRAME_BYTES
                )));
            }
            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                self.buf.advance(self.buf.len());
                return Err(MurmurError::ConnectionClosed);
            }
        }
    }
}

/// Serve one connection to completion. Cleanup (connection deregistration
/// and group membership removal) always runs, whatever ends the loop.
pub async fn serve(broker: SharedBroker, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let consumer_id = broker.connections().mint_id();
    debug!(%peer, consumer = %consumer_id, "connection accepted");

    let (read_half, mut write_half) = stream.into_split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if write_half.write_all(frame.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    broker.connections().register(consumer_id.clone(), outbound.clone());

    let handler = Handler::new(broker.clone(), consumer_id.clone(), outbound);
    let mut reader = LineReader::new(read_half);
    let result = read_loop(&mut reader, &handler).await;

    broker.handle_disconnect(&consumer_id);
    writer.abort();
    debug!(%peer, consumer = %consumer_id, "connection closed");

    match result {
        Err(MurmurError::ConnectionClosed) | Ok(()) => Ok(()),
        Err(e) => Err(e),
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    reader: &mut LineReader<R>,
    handler: &Handler,
) -> Result<()> {
    loop {
        match reader.read_line().await {
            Ok(Some(line)) => handler.handle_line(&line)?,
            Ok(None) => return Ok(()),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                // Oversized or non-UTF-8 frame: the stream position is no
                // longer trustworthy, drop the connection.
                warn!(error = %e, "unrecoverable framing error");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_split_on_newlines() {
        let input: &[u8] = b"first\nsecond\nthird\n";
        let mut reader = LineReader::new(input);
        assert_eq!(reader.read_line().await.unwrap(), Some("first".into()));
        assert_eq!(reader.read_line().await.unwrap(), Some("second".into()));
        assert_eq!(reader.read_line().await.unwrap(), Some("third".into()));
        assert_eq!(reader.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let input: &[u8] = b"unterminated";
        let mut reader = LineReader::new(input);
        assert!(matches!(
            reader.read_line().await,
            Err(MurmurError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let mut big = vec![b'x'; MAX_FRAME_BYTES + 2];
        big.push(b'\n');
        let mut reader = LineReader::new(big.as_slice());
        assert!(matches!(
            reader.read_line().await,
            Err(MurmurError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn empty_lines_pass_through() {
        let input: &[u8] = b"\na\n";
        let mut reader = LineReader::new(input);
        assert_eq!(reader.read_line().await.unwrap(), Some(String::new()));
        assert_eq!(reader.read_line().await.unwrap(), Some("a".into()));
    }
}
