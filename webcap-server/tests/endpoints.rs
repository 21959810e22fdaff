//! The server endpoints, exercised over real sockets.

use std::sync::Arc;
use webcap_core::session::{RpcSession, SessionConfig};
use webcap_core::testing::EchoTarget;
use webcap_core::value::Value;
use webcap_server::{process_batch, Server, ServerConfig};
use webcap_transport::{drive, WebSocketClient};

async fn spawn_server() -> String {
    let server = Server::new(ServerConfig::default(), Arc::new(EchoTarget::new()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server.router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr.to_string()
}

#[tokio::test]
async fn batch_processing_answers_pushes() {
    let body = "[\"push\",-1,[\"pipeline\",0,[\"square\"],[[5]]]]\n[\"pull\",1]";
    let out = process_batch(Arc::new(EchoTarget::new()), body).await.unwrap();
    assert_eq!(out, r#"["resolve",-1,25]"#);
}

#[tokio::test]
async fn batch_with_pipelining_resolves_every_slot() {
    let body = "[\"push\",-1,[\"pipeline\",0,[\"getUser\"],[[\"alice\"]]]]\n\
                [\"push\",-2,[\"pipeline\",-1,[\"name\"]]]\n\
                [\"pull\",2]";
    let out = process_batch(Arc::new(EchoTarget::new()), body).await.unwrap();
    assert!(out.contains(r#"["resolve",-2,"alice"]"#));
    assert!(out.lines().count() == 2);
}

#[tokio::test]
async fn malformed_batch_reports_the_line() {
    let err = process_batch(Arc::new(EchoTarget::new()), "not json").await.unwrap_err();
    assert!(err.to_string().contains("line 1"));
}

#[tokio::test]
async fn http_batch_endpoint_round_trips() {
    let addr = spawn_server().await;
    let body = "[\"push\",-1,[\"pipeline\",0,[\"add\"],[[3,7]]]]\n[\"pull\",1]";
    let response = reqwest::Client::new()
        .post(format!("http://{}/rpc", addr))
        .header("Content-Type", "text/plain")
        .body(body)
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    assert_eq!(response.text().await.unwrap(), r#"["resolve",-1,10]"#);
}

#[tokio::test]
async fn websocket_endpoint_serves_sessions() {
    let addr = spawn_server().await;
    let transport = WebSocketClient::new(format!("ws://{}/rpc", addr))
        .connect()
        .await
        .unwrap();

    let (client, receiver) =
        RpcSession::new(Arc::new(EchoTarget::new()), SessionConfig::default());
    let driven = client.clone();
    tokio::spawn(async move {
        let _ = drive(driven, receiver, transport).await;
    });

    assert_eq!(
        client.call("square", vec![Value::Int(9)]).await.unwrap(),
        Value::Int(81)
    );
    let counter = client
        .call("makeCounter", vec![Value::Int(5)])
        .await
        .unwrap();
    let stub = counter.as_stub().expect("counter capability").clone();
    assert_eq!(stub.invoke("increment", vec![]).await.unwrap(), Value::Int(6));

    client.close().await;
}
