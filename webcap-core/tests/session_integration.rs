//! End-to-end tests over two linked sessions: each peer's outbound frames
//! are pumped into the other's dispatcher, exactly as a transport would.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use webcap_core::session::{RpcSession, SessionConfig, SessionReceiver};
use webcap_core::testing::{Counter, EchoTarget, RecordingCallback};
use webcap_core::value::Value;
use webcap_core::{ErrorKind, RpcError, RpcTarget};

/// Pump one direction, counting frames.
fn pump(mut rx: SessionReceiver, peer: RpcSession) -> Arc<AtomicUsize> {
    let frames = Arc::new(AtomicUsize::new(0));
    let counter = frames.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx.outbound.recv().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = peer.handle_message(msg).await;
        }
    });
    frames
}

struct Linked {
    client: RpcSession,
    server: RpcSession,
    client_to_server: Arc<AtomicUsize>,
}

fn linked_with(
    client_main: Arc<dyn RpcTarget>,
    server_main: Arc<dyn RpcTarget>,
    client_config: SessionConfig,
) -> Linked {
    let (client, client_rx) = RpcSession::new(client_main, client_config);
    let (server, server_rx) = RpcSession::new(server_main, SessionConfig::default());
    let client_to_server = pump(client_rx, server.clone());
    pump(server_rx, client.clone());
    Linked {
        client,
        server,
        client_to_server,
    }
}

fn linked() -> Linked {
    linked_with(
        Arc::new(EchoTarget::new()),
        Arc::new(EchoTarget::new()),
        SessionConfig::default(),
    )
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn basic_calls() {
    let link = linked();
    assert_eq!(
        link.client.call("square", vec![Value::Int(5)]).await.unwrap(),
        Value::Int(25)
    );
    assert_eq!(
        link.client
            .call("greet", vec![Value::String("World".into())])
            .await
            .unwrap(),
        Value::String("Hello, World!".into())
    );
    assert_eq!(
        link.client
            .call("echo", vec![Value::Array(vec![Value::Int(1), Value::Int(2)])])
            .await
            .unwrap(),
        Value::Array(vec![Value::Int(1), Value::Int(2)])
    );
}

#[tokio::test]
async fn concurrent_calls_share_the_session() {
    let link = linked();
    let calls = (0..10).map(|n| {
        let client = link.client.clone();
        async move { client.call("square", vec![Value::Int(n)]).await }
    });
    let results = futures::future::join_all(calls).await;
    for (n, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), Value::Int((n * n) as i64));
    }
}

#[tokio::test]
async fn an_error_does_not_break_the_session() {
    let link = linked();
    assert_eq!(
        link.client.call("square", vec![Value::Int(5)]).await.unwrap(),
        Value::Int(25)
    );

    let err = link.client.call("throwError", vec![]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Internal);
    assert_eq!(err.message, "boom");

    assert_eq!(
        link.client.call("square", vec![Value::Int(6)]).await.unwrap(),
        Value::Int(36)
    );

    let err = link.client.call("noSuchMethod", vec![]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    assert!(link.client.is_active());
}

#[tokio::test]
async fn pipelined_chain_is_one_round_trip() {
    let link = linked();

    let user = link
        .client
        .main_stub()
        .call("getUser", vec![Value::String("alice".into())])
        .unwrap();
    let name = user.get("name").resolve().await.unwrap();
    assert_eq!(name, Value::String("alice".into()));

    // Two pushes plus one pull went client -> server, in a single flush.
    assert_eq!(link.client_to_server.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn promise_as_argument_feeds_dependent_call() {
    let link = linked();

    let user = link
        .client
        .main_stub()
        .call("getUser", vec![Value::String("bob".into())])
        .unwrap();
    // The unresolved promise rides as a pipeline reference; the server
    // materializes it from the slot it is still evaluating.
    let echoed = link
        .client
        .main_stub()
        .invoke("echo", vec![Value::Stub(user)])
        .await
        .unwrap();
    let map = echoed.as_object().expect("echo of a user object");
    assert_eq!(map.get("name"), Some(&Value::String("bob".into())));
}

#[derive(Debug)]
struct CounterHost {
    counter: Arc<Counter>,
}

#[async_trait]
impl RpcTarget for CounterHost {
    async fn call(&self, method: &str, _args: Vec<Value>) -> Result<Value, RpcError> {
        match method {
            "getCounter" => Ok(Value::Target(self.counter.clone())),
            other => Err(RpcError::not_found(format!("unknown method {:?}", other))),
        }
    }
}

#[tokio::test]
async fn capability_passing_and_dispose() {
    let counter = Arc::new(Counter::new(10));
    let link = linked_with(
        Arc::new(EchoTarget::new()),
        Arc::new(CounterHost {
            counter: counter.clone(),
        }),
        SessionConfig::default(),
    );

    let result = link.client.call("getCounter", vec![]).await.unwrap();
    let stub = match result {
        Value::Stub(stub) => stub,
        other => panic!("expected a stub, got {:?}", other),
    };

    assert_eq!(
        stub.invoke("increment", vec![]).await.unwrap(),
        Value::Int(11)
    );
    assert_eq!(
        stub.invoke("increment", vec![Value::Int(5)]).await.unwrap(),
        Value::Int(16)
    );
    // Property access walks get_property on the hosted target.
    assert_eq!(
        stub.get("count").resolve().await.unwrap(),
        Value::Int(16)
    );

    assert!(!counter.was_disposed());
    stub.dispose();
    eventually(|| counter.was_disposed()).await;
}

#[tokio::test]
async fn callbacks_flow_backwards() {
    let callback = Arc::new(RecordingCallback::new());
    let link = linked();

    let registered = link
        .client
        .call("registerCallback", vec![Value::Target(callback.clone())])
        .await
        .unwrap();
    assert_eq!(registered, Value::String("registered".into()));

    for n in 1..=3u32 {
        let pong = link.client.call("triggerCallback", vec![]).await.unwrap();
        assert_eq!(pong, Value::String(format!("pong-{}", n)));
    }
    assert_eq!(
        callback.notifications(),
        vec!["ping".to_string(), "ping".to_string(), "ping".to_string()]
    );
}

#[derive(Debug)]
struct FailingCallback;

#[async_trait]
impl RpcTarget for FailingCallback {
    async fn call(&self, method: &str, _args: Vec<Value>) -> Result<Value, RpcError> {
        Err(RpcError::permission_denied(format!(
            "{} refused by callback",
            method
        )))
    }
}

#[tokio::test]
async fn callback_errors_propagate_to_the_triggering_side() {
    let link = linked();
    link.client
        .call("registerCallback", vec![Value::Target(Arc::new(FailingCallback))])
        .await
        .unwrap();

    let err = link.client.call("triggerCallback", vec![]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::PermissionDenied);
    assert!(link.client.is_active());
}

#[derive(Debug)]
struct SlowTarget;

#[async_trait]
impl RpcTarget for SlowTarget {
    async fn call(&self, _method: &str, _args: Vec<Value>) -> Result<Value, RpcError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Value::Null)
    }
}

#[tokio::test]
async fn per_call_timeout_cancels_the_awaiter() {
    let link = linked_with(
        Arc::new(EchoTarget::new()),
        Arc::new(SlowTarget),
        SessionConfig {
            call_timeout: Some(Duration::from_millis(50)),
            sanitizer: None,
        },
    );

    let err = link.client.call("linger", vec![]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Canceled);
    // The import was released; the late resolution will be dropped silently.
    assert_eq!(link.client.stats().imports, 0);
}

#[tokio::test]
async fn typed_values_survive_a_full_trip() {
    let link = linked();
    for value in [
        Value::Undefined,
        Value::Float(f64::NAN),
        Value::Float(f64::INFINITY),
        Value::Bytes(bytes::Bytes::from_static(b"\x00\xff")),
        Value::Date(1700000000123.0),
        Value::BigInt(webcap_core::BigInt::new("98765432109876543210").unwrap()),
    ] {
        let back = link.client.call("echo", vec![value.clone()]).await.unwrap();
        assert_eq!(back, value);
    }
}

#[tokio::test]
async fn graceful_close_leaves_no_entries() {
    let link = linked();
    for n in 0..5 {
        link.client.call("square", vec![Value::Int(n)]).await.unwrap();
    }
    // Slot releases are coalesced onto the next tick; wait for them to land.
    eventually(|| link.server.stats().exports == 1).await;

    link.client.close().await;
    assert!(!link.client.is_active());
    assert_eq!(link.client.stats().imports, 0);
    assert_eq!(link.client.stats().exports, 0);

    let err = link.client.call("square", vec![Value::Int(1)]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Canceled);
}

#[tokio::test]
async fn protocol_violation_aborts_both_sides() {
    let link = linked();
    // A bogus release straight into the server's dispatcher.
    let msg = webcap_core::Message::Release(99, 1);
    assert!(link.server.handle_message(msg).await.is_err());
    assert!(!link.server.is_active());

    // The abort frame reaches the client and fails it too.
    eventually(|| !link.client.is_active()).await;
}

#[tokio::test]
async fn drain_waits_for_in_flight_work() {
    let link = linked();
    let client = link.client.clone();
    let call = tokio::spawn(async move { client.call("square", vec![Value::Int(9)]).await });
    link.client.drain().await;
    assert_eq!(call.await.unwrap().unwrap(), Value::Int(81));
}
