//! `StreamTransport`: the reliable byte-stream abstraction `Connection` is generic over.
//!
//! Anything that is an async, ordered, reliable byte stream (a TCP socket, a duplex test pipe)
//! implements it for free through the blanket impl below, the same way the source's
//! `Connection` only demanded a raw socket handle it could `send`/`recv` on.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::NetError;

#[async_trait]
pub trait StreamTransport: Send {
    async fn send_all(&mut self, buf: &[u8]) -> Result<(), NetError>;
    async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<(), NetError>;
    async fn shutdown(&mut self);
}

#[async_trait]
impl<T> StreamTransport for T
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_all(&mut self, buf: &[u8]) -> Result<(), NetError> {
        self.write_all(buf).await.map_err(NetError::Io)
    }

    async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<(), NetError> {
        self.read_exact(buf)
            .await
            .map(|_| ())
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    NetError::ConnectionClosed
                } else {
                    NetError::Io(e)
                }
            })
    }

    async fn shutdown(&mut self) {
        let _ = AsyncWriteExt::shutdown(self).await;
    }
}
