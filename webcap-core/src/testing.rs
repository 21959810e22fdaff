//! Fixture capabilities for integration tests and examples.
//!
//! The surface mirrors the cross-implementation interop suite: an echo/math
//! target, a counter capability returned as a nested export, and a callback
//! registry for bidirectional calls.

use crate::error::RpcError;
use crate::value::Value;
use crate::RpcTarget;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// The standard test target served as the main capability.
#[derive(Debug, Default)]
pub struct EchoTarget {
    callback: Mutex<Option<Value>>,
    trigger_count: AtomicU64,
}

impl EchoTarget {
    pub fn new() -> Self {
        Self::default()
    }
}

fn arg_i64(args: &[Value], idx: usize) -> Result<i64, RpcError> {
    args.get(idx)
        .and_then(Value::as_i64)
        .ok_or_else(|| RpcError::bad_request(format!("argument {} must be an integer", idx)))
}

fn arg_str<'a>(args: &'a [Value], idx: usize) -> Result<&'a str, RpcError> {
    args.get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::bad_request(format!("argument {} must be a string", idx)))
}

#[async_trait]
impl RpcTarget for EchoTarget {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        match method {
            "echo" => Ok(args.into_iter().next().unwrap_or(Value::Undefined)),
            "square" => {
                let n = arg_i64(&args, 0)?;
                Ok(Value::Int(n * n))
            }
            "add" => Ok(Value::Int(arg_i64(&args, 0)? + arg_i64(&args, 1)?)),
            "greet" => Ok(Value::String(format!("Hello, {}!", arg_str(&args, 0)?))),
            "returnNull" => Ok(Value::Null),
            "generateFibonacci" => {
                let count = arg_i64(&args, 0)?.max(0) as usize;
                let mut fib: Vec<Value> = Vec::with_capacity(count);
                let (mut a, mut b) = (0i64, 1i64);
                for _ in 0..count {
                    fib.push(Value::Int(a));
                    (a, b) = (b, a + b);
                }
                Ok(Value::Array(fib))
            }
            "getUser" => {
                let name = arg_str(&args, 0)?.to_string();
                let mut user = std::collections::HashMap::new();
                user.insert("name".to_string(), Value::String(name.clone()));
                user.insert("id".to_string(), Value::Int(name.len() as i64));
                Ok(Value::Object(user))
            }
            "makeCounter" => {
                let start = arg_i64(&args, 0)?;
                Ok(Value::Target(Arc::new(Counter::new(start))))
            }
            "registerCallback" => {
                let stub = args
                    .into_iter()
                    .next()
                    .filter(|v| matches!(v, Value::Stub(_)))
                    .ok_or_else(|| RpcError::bad_request("expected a capability argument"))?;
                *self.callback.lock().unwrap() = Some(stub);
                Ok(Value::String("registered".into()))
            }
            "triggerCallback" => {
                let callback = self
                    .callback
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or_else(|| RpcError::bad_request("no callback registered"))?;
                let n = self.trigger_count.fetch_add(1, Ordering::SeqCst) + 1;
                match callback {
                    Value::Stub(stub) => {
                        stub.invoke("notify", vec![Value::String("ping".into())])
                            .await?;
                        Ok(Value::String(format!("pong-{}", n)))
                    }
                    _ => Err(RpcError::internal("callback is not a stub")),
                }
            }
            "throwError" => Err(RpcError::internal("boom")),
            other => Err(RpcError::not_found(format!("unknown method {:?}", other))),
        }
    }
}

/// A stateful capability handed out by `makeCounter`.
#[derive(Debug)]
pub struct Counter {
    value: AtomicI64,
    disposed: AtomicBool,
}

impl Counter {
    pub fn new(start: i64) -> Self {
        Self {
            value: AtomicI64::new(start),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn was_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RpcTarget for Counter {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        match method {
            "increment" => {
                let by = args.first().and_then(Value::as_i64).unwrap_or(1);
                Ok(Value::Int(self.value.fetch_add(by, Ordering::SeqCst) + by))
            }
            "value" => Ok(Value::Int(self.value.load(Ordering::SeqCst))),
            other => Err(RpcError::not_found(format!("unknown method {:?}", other))),
        }
    }

    async fn get_property(&self, property: &str) -> Result<Value, RpcError> {
        match property {
            "count" => Ok(Value::Int(self.value.load(Ordering::SeqCst))),
            other => Err(RpcError::not_found(format!("unknown property {:?}", other))),
        }
    }

    async fn dispose(&self) -> Result<(), RpcError> {
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A callback target for the client side of bidirectional tests.
#[derive(Debug, Default)]
pub struct RecordingCallback {
    notifications: Mutex<Vec<String>>,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<String> {
        self.notifications.lock().unwrap().clone()
    }
}

#[async_trait]
impl RpcTarget for RecordingCallback {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        match method {
            "notify" => {
                let text = arg_str(&args, 0)?.to_string();
                let mut log = self.notifications.lock().unwrap();
                log.push(text.clone());
                Ok(Value::String(format!("Got: {}", text)))
            }
            other => Err(RpcError::not_found(format!("unknown method {:?}", other))),
        }
    }
}
