//! The axum-based server.
//!
//! One route serves both transports: a WebSocket upgrade starts a long-lived
//! bidirectional session, a POST runs a one-shot batch session whose response
//! is written once the last pending push has resolved.

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use webcap_core::session::{RpcSession, SessionConfig};
use webcap_core::wire::{parse_batch, serialize_batch, serialize_frame, Message, WireError};
use webcap_core::RpcTarget;
use webcap_transport::{drive, RpcTransport, TransportError};

#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound on an HTTP batch body.
    pub max_batch_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_batch_bytes: 1024 * 1024,
        }
    }
}

#[derive(Clone)]
pub struct Server {
    config: ServerConfig,
    main: Arc<dyn RpcTarget>,
}

impl Server {
    pub fn new(config: ServerConfig, main: Arc<dyn RpcTarget>) -> Self {
        Server { config, main }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/rpc", get(ws_handler).post(batch_handler))
            .with_state(self.clone())
    }

    pub async fn run(self) -> std::io::Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "webcap server listening");
        axum::serve(listener, self.router()).await
    }
}

async fn ws_handler(State(server): State<Server>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_socket(server, socket))
}

async fn serve_socket(server: Server, socket: WebSocket) {
    let (session, receiver) = RpcSession::new(server.main.clone(), SessionConfig::default());
    debug!("websocket session started");
    if let Err(e) = drive(session, receiver, AxumWsTransport { socket }).await {
        warn!(error = %e, "websocket session ended with transport error");
    } else {
        debug!("websocket session ended");
    }
}

async fn batch_handler(State(server): State<Server>, body: String) -> Response {
    if body.len() > server.config.max_batch_bytes {
        return (StatusCode::PAYLOAD_TOO_LARGE, "batch too large").into_response();
    }
    match process_batch(server.main.clone(), &body).await {
        Ok(out) => (StatusCode::OK, out).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

/// Run one batch of frames through a fresh session and return the response
/// batch. The session completes after the last pending push resolves.
pub async fn process_batch(
    main: Arc<dyn RpcTarget>,
    body: &str,
) -> Result<String, WireError> {
    let messages = parse_batch(body)?;
    let (session, mut receiver) = RpcSession::new(main, SessionConfig::default());
    for msg in messages {
        if session.handle_message(msg).await.is_err() {
            // The abort frame is already queued; stop feeding.
            break;
        }
    }
    session.settle().await;

    let mut out = Vec::new();
    while let Ok(msg) = receiver.outbound.try_recv() {
        out.push(msg);
    }
    debug!(frames = out.len(), "batch complete");
    Ok(serialize_batch(&out))
}

/// webcap transport over axum's server-side WebSocket.
struct AxumWsTransport {
    socket: WebSocket,
}

#[async_trait]
impl RpcTransport for AxumWsTransport {
    async fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        self.socket
            .send(WsMessage::Text(serialize_frame(&msg)))
            .await
            .map_err(|e| TransportError::Protocol(format!("websocket send failed: {}", e)))
    }

    async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        loop {
            match self.socket.recv().await {
                None => return Ok(None),
                Some(Ok(WsMessage::Text(text))) => {
                    let json: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
                        TransportError::Protocol(format!("frame is not valid JSON: {}", e))
                    })?;
                    return Ok(Some(Message::from_json(&json)?));
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    let text = String::from_utf8(data).map_err(|_| {
                        TransportError::Protocol("binary frame is not UTF-8".into())
                    })?;
                    let json: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
                        TransportError::Protocol(format!("frame is not valid JSON: {}", e))
                    })?;
                    return Ok(Some(Message::from_json(&json)?));
                }
                Some(Ok(WsMessage::Close(_))) => return Ok(None),
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                Some(Err(e)) => return Err(TransportError::Protocol(e.to_string())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // axum closes the socket when it is dropped.
        Ok(())
    }
}
