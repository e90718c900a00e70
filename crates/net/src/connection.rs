//! A framed connection: a transport plus the last-seen timestamp the heartbeat loop reads.

use std::time::Instant;

use tracing::trace;

use crate::protocol::MsgType;
use crate::transport::StreamTransport;
use crate::NetError;

/// One live peer connection. Generic over the transport so tests can drive it with an in-memory
/// duplex pipe instead of a real socket.
pub struct Connection<T: StreamTransport> {
    transport: T,
    peer_addr: String,
    last_seen: Instant,
}

impl<T: StreamTransport> Connection<T> {
    pub fn new(transport: T, peer_addr: impl Into<String>) -> Self {
        Self {
            transport,
            peer_addr: peer_addr.into(),
            last_seen: Instant::now(),
        }
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Encodes `[len_be][type][payload]` and writes it with send-all semantics.
    pub async fn send_message(&mut self, msg_type: MsgType, payload: &[u8]) -> Result<(), NetError> {
        let len = 1u32 + payload.len() as u32;
        let mut frame = Vec::with_capacity(4 + len as usize);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.push(msg_type.as_u8());
        frame.extend_from_slice(payload);
        self.transport.send_all(&frame).await
    }

    /// Reads one frame. Returns the raw type tag (unknown tags are the dispatcher's problem, not
    /// this layer's) and the payload. A zero-length frame is a protocol violation that closes
    /// the connection, so it surfaces as an error rather than a tag/payload pair.
    pub async fn recv_message(&mut self) -> Result<(u8, Vec<u8>), NetError> {
        let mut len_buf = [0u8; 4];
        self.transport.recv_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf);
        if len == 0 {
            return Err(NetError::ZeroLengthFrame);
        }
        let mut buf = vec![0u8; len as usize];
        self.transport.recv_exact(&mut buf).await?;
        self.touch();
        let tag = buf[0];
        let payload = buf[1..].to_vec();
        trace!(peer = %self.peer_addr, tag, len = payload.len(), "received frame");
        Ok((tag, payload))
    }

    pub async fn close(mut self) {
        self.transport.shutdown().await;
    }
}
