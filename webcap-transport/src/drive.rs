//! The session drive loop: pumps outbound frames from a session onto a
//! transport and inbound frames into the dispatcher, until either side ends.

use crate::{RpcTransport, TransportError};
use tracing::debug;
use webcap_core::{RpcError, RpcSession, SessionReceiver};

/// Run a session against a transport until the session closes or the
/// connection drops.
///
/// Writes are serialized here (the one write path), reads are fed to
/// [`RpcSession::handle_message`] strictly in order. When the session flips
/// its closed flag the remaining outbound frames are flushed and the
/// transport is closed; when the transport dies the session fails and every
/// pending awaiter gets a disconnect error.
pub async fn drive<T: RpcTransport>(
    session: RpcSession,
    mut receiver: SessionReceiver,
    mut transport: T,
) -> Result<(), TransportError> {
    loop {
        tokio::select! {
            biased;

            maybe = receiver.outbound.recv() => match maybe {
                Some(msg) => {
                    if let Err(e) = transport.send(msg).await {
                        session.fail(RpcError::disconnected());
                        return Err(e);
                    }
                }
                None => return Ok(()),
            },

            _ = receiver.closed.changed() => {
                while let Ok(msg) = receiver.outbound.try_recv() {
                    if transport.send(msg).await.is_err() {
                        break;
                    }
                }
                debug!("session closed, closing transport");
                let _ = transport.close().await;
                return Ok(());
            },

            inbound = transport.recv() => match inbound {
                Ok(Some(msg)) => {
                    // Fatal dispatch errors abort the session internally;
                    // the loop keeps going long enough to flush the abort.
                    let _ = session.handle_message(msg).await;
                }
                Ok(None) => {
                    debug!("transport closed by peer");
                    session.fail(RpcError::disconnected());
                    return Ok(());
                }
                Err(e) => {
                    session.fail(RpcError::disconnected());
                    return Err(e);
                }
            },
        }
    }
}
