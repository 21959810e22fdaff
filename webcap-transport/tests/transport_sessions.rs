//! Full sessions over real transports.

use std::sync::Arc;
use std::time::Duration;
use webcap_core::session::{RpcSession, SessionConfig};
use webcap_core::testing::EchoTarget;
use webcap_core::value::Value;
use webcap_core::ErrorKind;
use webcap_transport::{drive, memory_pair, WebSocketClient, WebSocketTransport};

fn spawn_session(
    main: Arc<dyn webcap_core::RpcTarget>,
    transport: impl webcap_transport::RpcTransport + 'static,
) -> RpcSession {
    let (session, receiver) = RpcSession::new(main, SessionConfig::default());
    let driven = session.clone();
    tokio::spawn(async move {
        let _ = drive(driven, receiver, transport).await;
    });
    session
}

#[tokio::test]
async fn calls_over_a_memory_pair() {
    let (client_end, server_end) = memory_pair();
    let _server = spawn_session(Arc::new(EchoTarget::new()), server_end);
    let client = spawn_session(Arc::new(EchoTarget::new()), client_end);

    assert_eq!(
        client.call("square", vec![Value::Int(12)]).await.unwrap(),
        Value::Int(144)
    );
    assert_eq!(
        client.call("add", vec![Value::Int(3), Value::Int(7)]).await.unwrap(),
        Value::Int(10)
    );
}

#[tokio::test]
async fn close_shuts_both_ends_down() {
    let (client_end, server_end) = memory_pair();
    let server = spawn_session(Arc::new(EchoTarget::new()), server_end);
    let client = spawn_session(Arc::new(EchoTarget::new()), client_end);

    client.call("square", vec![Value::Int(2)]).await.unwrap();
    client.close().await;
    assert!(!client.is_active());

    // The server notices the closed transport and fails its session.
    for _ in 0..100 {
        if !server.is_active() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("server session never failed after close");
}

#[tokio::test]
async fn dropped_transport_fails_pending_awaiters() {
    let (client_end, server_end) = memory_pair();
    let client = spawn_session(Arc::new(EchoTarget::new()), client_end);

    // No server session: the far end is dropped immediately.
    drop(server_end);

    let err = client.call("square", vec![Value::Int(2)]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Canceled);
}

#[tokio::test]
async fn calls_over_a_real_websocket() {
    // Accept one connection and serve an EchoTarget session over it.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (session, receiver) =
            RpcSession::new(Arc::new(EchoTarget::new()), SessionConfig::default());
        let _ = drive(session, receiver, WebSocketTransport::new(ws)).await;
    });

    let transport = WebSocketClient::new(format!("ws://{}/", addr))
        .connect()
        .await
        .unwrap();
    let client = spawn_session(Arc::new(EchoTarget::new()), transport);

    assert_eq!(
        client
            .call("greet", vec![Value::String("socket".into())])
            .await
            .unwrap(),
        Value::String("Hello, socket!".into())
    );

    let err = client.call("throwError", vec![]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Internal);

    client.close().await;
}
