//! Serves the test target on ws://127.0.0.1:8080/rpc (and HTTP batch on the
//! same route).

use std::sync::Arc;
use webcap_core::testing::EchoTarget;
use webcap_server::{init_logging, Server, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging("webcap=debug,info")?;
    let server = Server::new(ServerConfig::default(), Arc::new(EchoTarget::new()));
    server.run().await?;
    Ok(())
}
