//! WebSocket transport: one protocol frame per text message.

use crate::{RpcTransport, TransportError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{trace, warn};
use webcap_core::{serialize_frame, Message};

pub struct WebSocketTransport<S> {
    stream: WebSocketStream<S>,
}

impl<S> WebSocketTransport<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
{
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }
}

fn parse_frame(text: &str) -> Result<Message, TransportError> {
    let json: serde_json::Value = serde_json::from_str(text).map_err(|e| {
        TransportError::Protocol(format!("frame is not valid JSON: {}", e))
    })?;
    Ok(Message::from_json(&json)?)
}

#[async_trait]
impl<S> RpcTransport for WebSocketTransport<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
{
    async fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        let text = serialize_frame(&msg);
        trace!(frame = %text, "ws send");
        self.stream
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| TransportError::Protocol(format!("websocket send failed: {}", e)))
    }

    async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Ok(WsMessage::Text(text))) => {
                    trace!(frame = %text, "ws recv");
                    return parse_frame(&text).map(Some);
                }
                // Tolerate binary frames from peers that send UTF-8 bytes.
                Some(Ok(WsMessage::Binary(data))) => {
                    let text = String::from_utf8(data).map_err(|_| {
                        TransportError::Protocol("binary frame is not UTF-8".into())
                    })?;
                    return parse_frame(&text).map(Some);
                }
                Some(Ok(WsMessage::Close(_))) => return Ok(None),
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => continue,
                Some(Err(e)) => {
                    warn!(error = %e, "websocket receive failed");
                    return Err(TransportError::Protocol(e.to_string()));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::Protocol(format!("websocket close failed: {}", e)))
    }
}

/// Connects outbound WebSocket sessions.
pub struct WebSocketClient {
    url: String,
}

impl WebSocketClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub async fn connect(
        &self,
    ) -> Result<WebSocketTransport<MaybeTlsStream<TcpStream>>, TransportError> {
        let (stream, _) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| TransportError::Protocol(format!("failed to connect: {}", e)))?;
        Ok(WebSocketTransport::new(stream))
    }
}
