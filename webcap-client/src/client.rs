//! Long-lived WebSocket client.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use webcap_core::session::{RpcSession, SessionConfig};
use webcap_core::value::Value;
use webcap_core::{async_trait, RpcError, RpcTarget, Stub};
use webcap_transport::{drive, WebSocketClient};

#[derive(Clone)]
pub struct ClientConfig {
    /// RPC endpoint (`ws://…` for sessions, `http://…` for batches).
    pub url: String,
    /// Per-call timeout; expiry cancels the awaiter and releases the import.
    pub call_timeout: Duration,
    /// Maximum operations in one HTTP batch.
    pub max_batch_size: usize,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        ClientConfig {
            url: url.into(),
            ..Default::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            url: "ws://127.0.0.1:8080/rpc".to_string(),
            call_timeout: Duration::from_secs(30),
            max_batch_size: 100,
        }
    }
}

/// The default local main: a client that exposes no capabilities of its own.
#[derive(Debug)]
struct NoCapabilities;

#[async_trait]
impl RpcTarget for NoCapabilities {
    async fn call(&self, method: &str, _args: Vec<Value>) -> Result<Value, RpcError> {
        Err(RpcError::not_found(format!(
            "client exposes no method {:?}",
            method
        )))
    }
}

/// A connected bidirectional session over WebSocket.
pub struct WsClient {
    session: RpcSession,
}

impl WsClient {
    /// Connect, exposing no local capabilities.
    pub async fn connect(config: ClientConfig) -> anyhow::Result<Self> {
        Self::connect_with_main(config, Arc::new(NoCapabilities)).await
    }

    /// Connect, serving `local_main` as this side's main capability so the
    /// server can call back.
    pub async fn connect_with_main(
        config: ClientConfig,
        local_main: Arc<dyn RpcTarget>,
    ) -> anyhow::Result<Self> {
        let transport = WebSocketClient::new(&config.url).connect().await?;
        debug!(url = %config.url, "connected");
        let (session, receiver) = RpcSession::new(
            local_main,
            SessionConfig {
                call_timeout: Some(config.call_timeout),
                sanitizer: None,
            },
        );
        let driven = session.clone();
        tokio::spawn(async move {
            if let Err(e) = drive(driven, receiver, transport).await {
                debug!(error = %e, "session transport ended");
            }
        });
        Ok(WsClient { session })
    }

    /// The remote main capability.
    pub fn main(&self) -> Stub {
        self.session.main_stub()
    }

    /// One-shot call on the remote main capability.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.session.call(method, args).await
    }

    /// Await all in-flight work.
    pub async fn drain(&self) {
        self.session.drain().await;
    }

    /// Graceful shutdown.
    pub async fn close(&self) {
        self.session.close().await;
    }

    pub fn session(&self) -> &RpcSession {
        &self.session
    }
}
