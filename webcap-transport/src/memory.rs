//! An in-memory transport pair, for tests and same-process sessions.

use crate::{RpcTransport, TransportError};
use async_trait::async_trait;
use tokio::sync::mpsc;
use webcap_core::Message;

pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
}

/// Two transports wired back to back: what one sends, the other receives.
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport { tx: a_tx, rx: a_rx },
        MemoryTransport { tx: b_tx, rx: b_rx },
    )
}

#[async_trait]
impl RpcTransport for MemoryTransport {
    async fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        self.tx.send(msg).map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.rx.close();
        Ok(())
    }
}
