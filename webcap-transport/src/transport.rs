use async_trait::async_trait;
use thiserror::Error;
use webcap_core::WireError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] WireError),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A reliable, ordered, message-framed duplex stream.
///
/// `recv` returning `Ok(None)` means the peer closed cleanly; errors mean
/// the connection died. Implementations must keep frame boundaries intact:
/// one [`webcap_core::Message`] per frame.
#[async_trait]
pub trait RpcTransport: Send {
    async fn send(&mut self, msg: webcap_core::Message) -> Result<(), TransportError>;
    async fn recv(&mut self) -> Result<Option<webcap_core::Message>, TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}
