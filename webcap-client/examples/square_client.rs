//! Calls the echo server example: `cargo run --example echo_server` first.

use webcap_client::{ClientConfig, WsClient};
use webcap_core::value::Value;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let client = WsClient::connect(ClientConfig::new("ws://127.0.0.1:8080/rpc")).await?;

    let squared = client.call("square", vec![Value::Int(12)]).await?;
    println!("square(12) = {:?}", squared);

    // Pipelined: getUser("alice").name in a single round trip.
    let user = client
        .main()
        .call("getUser", vec![Value::String("alice".into())])?;
    let name = user.get("name").resolve().await?;
    println!("getUser(\"alice\").name = {:?}", name);

    client.close().await;
    Ok(())
}
