//! Session-aware translation between runtime values and wire expressions,
//! and the call engine that evaluates inbound expressions.
//!
//! Encoding is where capabilities are interned: a local target becomes an
//! `export` form (allocating or reusing an export id, counting the send), a
//! stub becomes an `import` form when it points straight at a capability the
//! peer hosts, or a `pipeline` form when it is pending or path-extended.
//!
//! Evaluation is the receiving half: it materializes literals, turns offered
//! capabilities into imports and stubs, resolves `pipeline` targets (waiting
//! on slots that have not completed yet), walks property paths, and invokes
//! methods on hosted targets.

use crate::error::{ErrorKind, RpcError};
use crate::ids::{ExportId, ImportId};
use crate::session::RpcSession;
use crate::tables::ExportRef;
use crate::value::{BigInt, Value};
use crate::wire::{PathKey, WireExpression};
use crate::stub::Stub;
use futures::future::BoxFuture;
use serde_json::{Number, Value as JsonValue};
use std::collections::HashMap;
use tracing::trace;

/// Method names user code may not dispatch to.
fn is_reserved_method(name: &str) -> bool {
    name == "dispose" || name == "dispatch" || name.starts_with('_')
}

impl RpcSession {
    // -----------------------------------------------------------------------
    // Encode: Value -> wire
    // -----------------------------------------------------------------------

    pub(crate) fn encode_value(&self, value: &Value) -> Result<WireExpression, RpcError> {
        match value {
            Value::Null => Ok(WireExpression::Null),
            Value::Undefined => Ok(WireExpression::Undefined),
            Value::Bool(b) => Ok(WireExpression::Bool(*b)),
            Value::Int(n) => Ok(WireExpression::Number(Number::from(*n))),
            Value::Float(f) => {
                if f.is_nan() {
                    Ok(WireExpression::Nan)
                } else if f.is_infinite() {
                    Ok(if *f > 0.0 {
                        WireExpression::Inf
                    } else {
                        WireExpression::NegInf
                    })
                } else {
                    Number::from_f64(*f)
                        .map(WireExpression::Number)
                        .ok_or_else(|| RpcError::internal("unencodable float"))
                }
            }
            Value::String(s) => Ok(WireExpression::String(s.clone())),
            Value::Bytes(b) => Ok(WireExpression::Bytes(b.clone())),
            Value::Date(millis) => Ok(WireExpression::Date(*millis)),
            Value::BigInt(b) => Ok(WireExpression::BigInt(b.as_str().to_string())),
            Value::Array(items) => {
                let encoded = items
                    .iter()
                    .map(|v| self.encode_value(v))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(WireExpression::EscapedArray(encoded))
            }
            Value::Object(map) => {
                let encoded = map
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.encode_value(v)?)))
                    .collect::<Result<HashMap<_, _>, RpcError>>()?;
                Ok(WireExpression::Object(encoded))
            }
            Value::Error(err) => Ok(self.encode_error(err)),
            Value::Target(target) => {
                let id = self.inner.exports.intern(target, &self.inner.alloc);
                trace!(%id, "encoded local capability");
                Ok(WireExpression::Export(id.wire_ref()))
            }
            Value::Stub(stub) => self.encode_stub(stub),
        }
    }

    fn encode_stub(&self, stub: &Stub) -> Result<WireExpression, RpcError> {
        if !stub.belongs_to(self) {
            return Err(RpcError::bad_request(
                "stub belongs to a different session",
            ));
        }
        let root = stub.import();
        if stub.path().is_empty() {
            if self.inner.imports.is_pending(root) {
                // A promise used as a value: the peer resolves it from the
                // slot it is evaluating.
                Ok(WireExpression::Pipeline {
                    id: root.wire_ref(),
                    path: None,
                    args: None,
                })
            } else {
                // Handing a capability back to the peer that issued it.
                Ok(WireExpression::Import(root.wire_ref()))
            }
        } else {
            Ok(WireExpression::Pipeline {
                id: root.wire_ref(),
                path: Some(stub.path().to_vec()),
                args: None,
            })
        }
    }

    /// Encode an error, passing it through the configured sanitizer first.
    pub(crate) fn encode_error(&self, err: &RpcError) -> WireExpression {
        let err = match &self.inner.config.sanitizer {
            Some(sanitize) => sanitize(err.clone()),
            None => err.clone(),
        };
        WireExpression::Error {
            kind: err.kind.as_str().to_string(),
            message: err.message,
            data: err.data.as_ref().map(|d| Box::new(json_to_wire(d))),
        }
    }

    /// Decode an error form; `None` when the expression is not one.
    pub(crate) fn decode_error(&self, expr: &WireExpression) -> Option<RpcError> {
        match expr {
            WireExpression::Error {
                kind,
                message,
                data,
            } => Some(RpcError {
                kind: ErrorKind::parse(kind),
                message: message.clone(),
                data: data.as_ref().and_then(|d| wire_to_json(d)),
            }),
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Evaluate: wire -> Value (the call engine)
    // -----------------------------------------------------------------------

    pub(crate) fn evaluate<'a>(
        &'a self,
        expr: &'a WireExpression,
    ) -> BoxFuture<'a, Result<Value, RpcError>> {
        Box::pin(async move {
            match expr {
                WireExpression::Null => Ok(Value::Null),
                WireExpression::Undefined => Ok(Value::Undefined),
                WireExpression::Bool(b) => Ok(Value::Bool(*b)),
                WireExpression::Number(n) => Ok(decode_number(n)),
                WireExpression::String(s) => Ok(Value::String(s.clone())),
                WireExpression::Bytes(b) => Ok(Value::Bytes(b.clone())),
                WireExpression::Date(millis) => Ok(Value::Date(*millis)),
                WireExpression::BigInt(digits) => Ok(Value::BigInt(BigInt::new(digits.clone())?)),
                WireExpression::Inf => Ok(Value::Float(f64::INFINITY)),
                WireExpression::NegInf => Ok(Value::Float(f64::NEG_INFINITY)),
                WireExpression::Nan => Ok(Value::Float(f64::NAN)),

                WireExpression::EscapedArray(items) => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(self.evaluate(item).await?);
                    }
                    Ok(Value::Array(values))
                }

                WireExpression::Object(map) => {
                    let mut values = HashMap::with_capacity(map.len());
                    for (k, v) in map {
                        values.insert(k.clone(), self.evaluate(v).await?);
                    }
                    Ok(Value::Object(values))
                }

                WireExpression::Error { .. } => {
                    // In-band failure value, not a protocol failure.
                    Ok(Value::Error(self.decode_error(expr).ok_or_else(|| {
                        RpcError::bad_request("malformed error form")
                    })?))
                }

                WireExpression::Export(id) => self.accept_offer(*id, false),
                WireExpression::Promise(id) => self.accept_offer(*id, true),

                WireExpression::Import(id) => {
                    // The peer is handing one of our own references back.
                    let key = ExportId::from_ref_wire(*id);
                    match self.inner.exports.get(key) {
                        Some(ExportRef::Target(target)) => Ok(Value::Target(target)),
                        Some(ExportRef::Slot(rx)) => await_slot(rx, key).await,
                        None => Err(RpcError::cap_revoked(format!(
                            "{} is not exported",
                            key
                        ))),
                    }
                }

                WireExpression::Pipeline { id, path, args } => {
                    self.evaluate_pipeline(*id, path.as_deref(), args.as_deref())
                        .await
                }
            }
        })
    }

    /// Materialize a capability (or promise) the peer is offering us.
    fn accept_offer(&self, wire_id: i64, pending: bool) -> Result<Value, RpcError> {
        if wire_id >= 0 {
            return Err(RpcError::bad_request(format!(
                "offered id must be negative, got {}",
                wire_id
            )));
        }
        let key = ImportId::from_offer_wire(wire_id);
        let imports = &self.inner.imports;
        if imports.contains(key) {
            imports
                .add_wire_ref(key)
                .map_err(|e| RpcError::internal(e.to_string()))?;
            return Ok(Value::Stub(Stub::new(self.downgrade(), key)));
        }
        let stub = Stub::new(self.downgrade(), key);
        let insert = if pending {
            imports.insert_promise(key)
        } else {
            imports.insert_offer(key, Value::Stub(stub.clone()))
        };
        insert.map_err(|e| RpcError::internal(e.to_string()))?;
        trace!(%key, pending, "accepted offered capability");
        Ok(Value::Stub(stub))
    }

    async fn evaluate_pipeline(
        &self,
        wire_id: i64,
        path: Option<&[PathKey]>,
        args: Option<&WireExpression>,
    ) -> Result<Value, RpcError> {
        let key = ExportId::from_ref_wire(wire_id);
        let base = match self.inner.exports.get(key) {
            Some(ExportRef::Target(target)) => Value::Target(target),
            Some(ExportRef::Slot(rx)) => await_slot(rx, key).await?,
            None => {
                return Err(RpcError::cap_revoked(format!(
                    "pipeline target {} is not exported",
                    key
                )))
            }
        };
        let path = path.unwrap_or(&[]);

        let Some(args) = args else {
            // Pure property walk.
            return self.walk_path(base, path).await;
        };

        // A call: the last path element names the method.
        let Some((PathKey::String(method), prefix)) = path.split_last() else {
            return Err(RpcError::bad_request(
                "call requires a method name as the last path element",
            ));
        };
        if is_reserved_method(method) {
            return Err(RpcError::bad_request(format!(
                "method name {:?} is reserved",
                method
            )));
        }
        let callee = self.walk_path(base, prefix).await?;
        let args = match self.evaluate(args).await? {
            Value::Array(items) => items,
            other => {
                return Err(RpcError::bad_request(format!(
                    "call arguments must be a list, got {}",
                    other.type_name()
                )))
            }
        };
        trace!(%key, method, argc = args.len(), "dispatching call");
        match callee {
            Value::Target(target) => target.call(method, args).await,
            Value::Stub(stub) => stub.invoke(method, args).await,
            other => Err(RpcError::bad_request(format!(
                "cannot call a method on {}",
                other.type_name()
            ))),
        }
    }

    /// Walk a property path. String keys apply to objects and capabilities,
    /// integer keys to arrays; anything else is a mismatch.
    async fn walk_path(&self, base: Value, path: &[PathKey]) -> Result<Value, RpcError> {
        let mut current = base;
        for key in path {
            current = match (current, key) {
                (Value::Object(mut map), PathKey::String(k)) => map.remove(k).ok_or_else(|| {
                    RpcError::not_found(format!("unknown property {:?}", k))
                })?,
                (Value::Array(items), PathKey::Index(i)) => {
                    items.into_iter().nth(*i).ok_or_else(|| {
                        RpcError::not_found(format!("index {} out of range", i))
                    })?
                }
                (Value::Target(target), PathKey::String(k)) => target.get_property(k).await?,
                // Walking into a remote stub just extends its path; the peer
                // that hosts it resolves the access.
                (Value::Stub(stub), PathKey::String(k)) => Value::Stub(stub.get(k)),
                (Value::Stub(stub), PathKey::Index(i)) => Value::Stub(stub.at(*i)),
                (other, PathKey::String(k)) => {
                    return Err(RpcError::bad_request(format!(
                        "cannot read property {:?} of {}",
                        k,
                        other.type_name()
                    )))
                }
                (other, PathKey::Index(i)) => {
                    return Err(RpcError::bad_request(format!(
                        "cannot index {} with {}",
                        other.type_name(),
                        i
                    )))
                }
            };
        }
        Ok(current)
    }
}

async fn await_slot(
    mut rx: tokio::sync::watch::Receiver<Option<Result<Value, RpcError>>>,
    key: ExportId,
) -> Result<Value, RpcError> {
    let outcome = rx
        .wait_for(|v| v.is_some())
        .await
        .map_err(|_| RpcError::canceled(format!("slot {} torn down", key)))?
        .clone();
    outcome.unwrap_or(Ok(Value::Null))
}

fn decode_number(n: &Number) -> Value {
    if let Some(i) = n.as_i64() {
        Value::Int(i)
    } else {
        Value::Float(n.as_f64().unwrap_or(f64::NAN))
    }
}

/// Encode a capability-free value without a session. Stubs and targets are
/// refused; everything else encodes exactly as the session codec would.
pub fn encode_plain(value: &Value) -> Result<WireExpression, RpcError> {
    match value {
        Value::Null => Ok(WireExpression::Null),
        Value::Undefined => Ok(WireExpression::Undefined),
        Value::Bool(b) => Ok(WireExpression::Bool(*b)),
        Value::Int(n) => Ok(WireExpression::Number(Number::from(*n))),
        Value::Float(f) => {
            if f.is_nan() {
                Ok(WireExpression::Nan)
            } else if f.is_infinite() {
                Ok(if *f > 0.0 {
                    WireExpression::Inf
                } else {
                    WireExpression::NegInf
                })
            } else {
                Number::from_f64(*f)
                    .map(WireExpression::Number)
                    .ok_or_else(|| RpcError::internal("unencodable float"))
            }
        }
        Value::String(s) => Ok(WireExpression::String(s.clone())),
        Value::Bytes(b) => Ok(WireExpression::Bytes(b.clone())),
        Value::Date(millis) => Ok(WireExpression::Date(*millis)),
        Value::BigInt(b) => Ok(WireExpression::BigInt(b.as_str().to_string())),
        Value::Array(items) => Ok(WireExpression::EscapedArray(
            items.iter().map(encode_plain).collect::<Result<_, _>>()?,
        )),
        Value::Object(map) => Ok(WireExpression::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), encode_plain(v)?)))
                .collect::<Result<_, RpcError>>()?,
        )),
        Value::Error(err) => Ok(WireExpression::Error {
            kind: err.kind.as_str().to_string(),
            message: err.message.clone(),
            data: err.data.as_ref().map(|d| Box::new(json_to_wire(d))),
        }),
        Value::Stub(_) | Value::Target(_) => Err(RpcError::bad_request(
            "capabilities cannot be encoded without a session",
        )),
    }
}

/// Decode a capability-free wire expression. Capability and pipeline forms
/// are refused.
pub fn decode_plain(expr: &WireExpression) -> Result<Value, RpcError> {
    match expr {
        WireExpression::Null => Ok(Value::Null),
        WireExpression::Undefined => Ok(Value::Undefined),
        WireExpression::Bool(b) => Ok(Value::Bool(*b)),
        WireExpression::Number(n) => Ok(decode_number(n)),
        WireExpression::String(s) => Ok(Value::String(s.clone())),
        WireExpression::Bytes(b) => Ok(Value::Bytes(b.clone())),
        WireExpression::Date(millis) => Ok(Value::Date(*millis)),
        WireExpression::BigInt(digits) => Ok(Value::BigInt(BigInt::new(digits.clone())?)),
        WireExpression::Inf => Ok(Value::Float(f64::INFINITY)),
        WireExpression::NegInf => Ok(Value::Float(f64::NEG_INFINITY)),
        WireExpression::Nan => Ok(Value::Float(f64::NAN)),
        WireExpression::EscapedArray(items) => Ok(Value::Array(
            items.iter().map(decode_plain).collect::<Result<_, _>>()?,
        )),
        WireExpression::Object(map) => Ok(Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), decode_plain(v)?)))
                .collect::<Result<_, RpcError>>()?,
        )),
        WireExpression::Error {
            kind,
            message,
            data,
        } => Ok(Value::Error(RpcError {
            kind: ErrorKind::parse(kind),
            message: message.clone(),
            data: data.as_ref().and_then(|d| wire_to_json(d)),
        })),
        WireExpression::Export(_)
        | WireExpression::Import(_)
        | WireExpression::Promise(_)
        | WireExpression::Pipeline { .. } => Err(RpcError::bad_request(
            "capability reference outside a session",
        )),
    }
}

/// Plain JSON (error data) into the wire dialect: arrays get escaped.
fn json_to_wire(value: &JsonValue) -> WireExpression {
    match value {
        JsonValue::Null => WireExpression::Null,
        JsonValue::Bool(b) => WireExpression::Bool(*b),
        JsonValue::Number(n) => WireExpression::Number(n.clone()),
        JsonValue::String(s) => WireExpression::String(s.clone()),
        JsonValue::Array(items) => {
            WireExpression::EscapedArray(items.iter().map(json_to_wire).collect())
        }
        JsonValue::Object(map) => WireExpression::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_wire(v)))
                .collect(),
        ),
    }
}

/// The inverse, for error data. Capability forms have no place in error
/// bodies and map to `None`.
fn wire_to_json(expr: &WireExpression) -> Option<JsonValue> {
    match expr {
        WireExpression::Null | WireExpression::Undefined => Some(JsonValue::Null),
        WireExpression::Bool(b) => Some(JsonValue::Bool(*b)),
        WireExpression::Number(n) => Some(JsonValue::Number(n.clone())),
        WireExpression::String(s) => Some(JsonValue::String(s.clone())),
        WireExpression::EscapedArray(items) => Some(JsonValue::Array(
            items.iter().map(wire_to_json).collect::<Option<Vec<_>>>()?,
        )),
        WireExpression::Object(map) => Some(JsonValue::Object(
            map.iter()
                .map(|(k, v)| Some((k.clone(), wire_to_json(v)?)))
                .collect::<Option<_>>()?,
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{RpcSession, SessionConfig, SessionReceiver};
    use crate::testing::EchoTarget;
    use crate::value::BigInt;
    use bytes::Bytes;
    use std::sync::Arc;

    fn session() -> (RpcSession, SessionReceiver) {
        RpcSession::new(Arc::new(EchoTarget::new()), SessionConfig::default())
    }

    async fn round_trip(value: Value) {
        let (session, _rx) = session();
        let wire = session.encode_value(&value).unwrap();
        // Through actual JSON text, as on the wire.
        let json_text = serde_json::to_string(&wire.to_json()).unwrap();
        let parsed = WireExpression::from_json(&serde_json::from_str(&json_text).unwrap()).unwrap();
        let back = session.evaluate(&parsed).await.unwrap();
        assert_eq!(back, value);
    }

    #[tokio::test]
    async fn scalars_round_trip() {
        round_trip(Value::Null).await;
        round_trip(Value::Undefined).await;
        round_trip(Value::Bool(true)).await;
        round_trip(Value::Int(0)).await;
        round_trip(Value::Int(-999999)).await;
        round_trip(Value::Float(3.14)).await;
        round_trip(Value::String("mixed: 日本語 and emoji 🎉".into())).await;
    }

    #[tokio::test]
    async fn int_float_class_is_preserved() {
        let (session, _rx) = session();
        let wire = session.encode_value(&Value::Int(1)).unwrap();
        assert_eq!(serde_json::to_string(&wire.to_json()).unwrap(), "1");
        let wire = session.encode_value(&Value::Float(1.0)).unwrap();
        assert_eq!(serde_json::to_string(&wire.to_json()).unwrap(), "1.0");
        round_trip(Value::Int(1)).await;
        round_trip(Value::Float(1.0)).await;
    }

    #[tokio::test]
    async fn nonfinite_floats_round_trip() {
        round_trip(Value::Float(f64::NAN)).await;
        round_trip(Value::Float(f64::INFINITY)).await;
        round_trip(Value::Float(f64::NEG_INFINITY)).await;
    }

    #[tokio::test]
    async fn typed_primitives_round_trip() {
        round_trip(Value::Bytes(Bytes::from_static(b"\x00\x01\xfe\xff"))).await;
        round_trip(Value::Date(1700000000123.0)).await;
        round_trip(Value::BigInt(
            BigInt::new("340282366920938463463374607431768211456").unwrap(),
        ))
        .await;
    }

    #[tokio::test]
    async fn arrays_and_objects_round_trip() {
        round_trip(Value::Array(vec![])).await;
        round_trip(Value::Array(vec![
            Value::Int(1),
            Value::Array(vec![Value::Int(2), Value::Int(3)]),
            Value::Null,
        ]))
        .await;

        let mut map = HashMap::new();
        map.insert("items".to_string(), Value::Array(vec![Value::Int(1)]));
        map.insert("null".to_string(), Value::Null);
        map.insert("absent".to_string(), Value::Undefined);
        round_trip(Value::Object(map)).await;
    }

    #[tokio::test]
    async fn error_values_round_trip_in_band() {
        round_trip(Value::Error(RpcError::with_data(
            ErrorKind::PermissionDenied,
            "nope",
            serde_json::json!({"who": "you", "paths": ["a", "b"]}),
        )))
        .await;
    }

    #[tokio::test]
    async fn plain_arrays_are_escaped_on_the_wire() {
        let (session, _rx) = session();
        let wire = session
            .encode_value(&Value::Array(vec![
                Value::Int(1),
                Value::Int(2),
                Value::Int(3),
            ]))
            .unwrap();
        assert_eq!(
            serde_json::to_string(&wire.to_json()).unwrap(),
            "[[1,2,3]]"
        );
    }

    #[tokio::test]
    async fn encoding_a_target_twice_reuses_the_export_id() {
        let (session, _rx) = session();
        let target: Arc<dyn crate::RpcTarget> = Arc::new(EchoTarget::new());
        let first = session.encode_value(&Value::Target(target.clone())).unwrap();
        let second = session.encode_value(&Value::Target(target.clone())).unwrap();
        assert_eq!(first, WireExpression::Export(-1));
        assert_eq!(second, WireExpression::Export(-1));
        // Two sends: two releases needed before the entry dies.
        assert!(session
            .inner
            .exports
            .release(crate::ids::ExportId(-1), 2)
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn sanitizer_rewrites_outbound_errors() {
        let config = SessionConfig {
            call_timeout: None,
            sanitizer: Some(Arc::new(|mut err: RpcError| {
                err.data = None;
                err.message = "redacted".into();
                err
            })),
        };
        let (session, _rx) = RpcSession::new(Arc::new(EchoTarget::new()), config);
        let wire = session.encode_error(&RpcError::with_data(
            ErrorKind::Internal,
            "secret stack trace",
            serde_json::json!({"stack": "..."}),
        ));
        match wire {
            WireExpression::Error { message, data, .. } => {
                assert_eq!(message, "redacted");
                assert!(data.is_none());
            }
            other => panic!("unexpected encoding: {:?}", other),
        }
    }

    #[tokio::test]
    async fn reserved_method_names_are_refused() {
        let (session, _rx) = session();
        for name in ["dispose", "dispatch", "_private"] {
            let expr = WireExpression::Pipeline {
                id: 0,
                path: Some(vec![PathKey::String(name.to_string())]),
                args: Some(Box::new(WireExpression::EscapedArray(vec![]))),
            };
            let err = session.evaluate(&expr).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::BadRequest, "{}", name);
        }
    }

    #[tokio::test]
    async fn path_mismatches_fail_with_bad_request_or_not_found() {
        let (session, _rx) = session();
        // Index into a non-array (the user object).
        let expr = WireExpression::Pipeline {
            id: 0,
            path: Some(vec![PathKey::String("getUser".into())]),
            args: Some(Box::new(WireExpression::EscapedArray(vec![
                WireExpression::String("alice".into()),
            ]))),
        };
        let user = session.evaluate(&expr).await.unwrap();
        assert!(user.as_object().is_some());

        let err = session
            .walk_path(user.clone(), &[PathKey::Index(0)])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadRequest);

        let err = session
            .walk_path(user, &[PathKey::String("missing".into())])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
