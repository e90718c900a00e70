//! Wire framing, the stream transport abstraction, and the per-connection state built on top.

mod connection;
mod protocol;
mod transport;

pub use connection::Connection;
pub use protocol::{MsgType, ResourceReportPayload};
pub use transport::StreamTransport;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("received a zero-length frame")]
    ZeroLengthFrame,
    #[error("invalid payload size: expected {expected}, got {actual}")]
    InvalidPayloadSize { expected: usize, actual: usize },
}
