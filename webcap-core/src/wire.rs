//! Wire syntax: frames and expressions.
//!
//! Every frame is one JSON array whose first element names the message type.
//! Values ride inside frames as an escaped JSON dialect: an array whose first
//! element is a known tag string is a special form, and a plain array is
//! always wrapped as the sole element of an outer array (`[[…]]`). Any other
//! array shape is a protocol error. This module is pure syntax; the id sign
//! conventions and capability interning live in the codec and session.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde_json::{Number, Value as JsonValue};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{trace, warn};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum WireError {
    #[error("invalid frame: {0}")]
    Frame(String),

    #[error("invalid expression: {0}")]
    Expression(String),

    #[error("invalid JSON on line {line}: {detail}")]
    Json { line: usize, detail: String },
}

/// The six frame kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `["push", export_id, expr]`: sender asserts a computation whose
    /// value lands at `export_id`.
    Push(i64, WireExpression),

    /// `["pull", import_id]`: sender requests resolution of a pushed slot.
    Pull(i64),

    /// `["resolve", export_id, value]`
    Resolve(i64, WireExpression),

    /// `["reject", export_id, error]`
    Reject(i64, WireExpression),

    /// `["release", import_id, refcount_delta]`
    Release(i64, u32),

    /// `["abort", error]`: session-fatal; both sides tear down.
    Abort(WireExpression),
}

impl Message {
    pub fn from_json(value: &JsonValue) -> Result<Self, WireError> {
        let arr = value
            .as_array()
            .ok_or_else(|| WireError::Frame("frame must be a JSON array".into()))?;
        Self::from_json_array(arr)
    }

    pub fn from_json_array(arr: &[JsonValue]) -> Result<Self, WireError> {
        let tag = arr
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| WireError::Frame("frame type must be a string".into()))?;

        trace!(tag, len = arr.len(), "parsing frame");

        let want = |n: usize| -> Result<(), WireError> {
            if arr.len() != n {
                warn!(tag, got = arr.len(), want = n, "frame arity mismatch");
                return Err(WireError::Frame(format!(
                    "{} requires exactly {} elements, got {}",
                    tag,
                    n,
                    arr.len()
                )));
            }
            Ok(())
        };
        let int_at = |i: usize| -> Result<i64, WireError> {
            arr[i]
                .as_i64()
                .ok_or_else(|| WireError::Frame(format!("{} id must be an integer", tag)))
        };

        match tag {
            "push" => {
                want(3)?;
                Ok(Message::Push(int_at(1)?, WireExpression::from_json(&arr[2])?))
            }
            "pull" => {
                want(2)?;
                Ok(Message::Pull(int_at(1)?))
            }
            "resolve" => {
                want(3)?;
                Ok(Message::Resolve(
                    int_at(1)?,
                    WireExpression::from_json(&arr[2])?,
                ))
            }
            "reject" => {
                want(3)?;
                Ok(Message::Reject(
                    int_at(1)?,
                    WireExpression::from_json(&arr[2])?,
                ))
            }
            "release" => {
                want(3)?;
                let delta = arr[2]
                    .as_u64()
                    .and_then(|d| u32::try_from(d).ok())
                    .ok_or_else(|| {
                        WireError::Frame("release delta must be a non-negative integer".into())
                    })?;
                Ok(Message::Release(int_at(1)?, delta))
            }
            "abort" => {
                want(2)?;
                Ok(Message::Abort(WireExpression::from_json(&arr[1])?))
            }
            other => {
                warn!(tag = other, "unknown frame type");
                Err(WireError::Frame(format!("unknown frame type: {}", other)))
            }
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Message::Push(id, expr) => {
                JsonValue::Array(vec!["push".into(), (*id).into(), expr.to_json()])
            }
            Message::Pull(id) => JsonValue::Array(vec!["pull".into(), (*id).into()]),
            Message::Resolve(id, value) => {
                JsonValue::Array(vec!["resolve".into(), (*id).into(), value.to_json()])
            }
            Message::Reject(id, error) => {
                JsonValue::Array(vec!["reject".into(), (*id).into(), error.to_json()])
            }
            Message::Release(id, delta) => {
                JsonValue::Array(vec!["release".into(), (*id).into(), (*delta).into()])
            }
            Message::Abort(error) => JsonValue::Array(vec!["abort".into(), error.to_json()]),
        }
    }
}

/// A value as it appears on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum WireExpression {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    /// A plain array, carried as `[[…]]` on the wire.
    EscapedArray(Vec<WireExpression>),
    Object(HashMap<String, WireExpression>),

    /// `["error", kind, message, data?]`
    Error {
        kind: String,
        message: String,
        data: Option<Box<WireExpression>>,
    },

    /// `["export", id]`: sender offers a capability it hosts.
    Export(i64),

    /// `["import", id]`: sender hands a capability back to its host.
    Import(i64),

    /// `["promise", id]`: like `export`, but the value is not yet resolved.
    Promise(i64),

    /// `["pipeline", id, path?, args?]`: a reference into an unresolved
    /// slot, optionally walked and optionally invoked.
    Pipeline {
        id: i64,
        path: Option<Vec<PathKey>>,
        args: Option<Box<WireExpression>>,
    },

    /// `["bytes", base64]`
    Bytes(Bytes),

    /// `["date", epochMillis]`
    Date(f64),

    /// `["bigint", decimalString]`
    BigInt(String),

    /// `["undefined"]`: distinct from null.
    Undefined,

    /// `["inf"]`, `["-inf"]`, `["nan"]`: non-finite floats, handled
    /// manually so no JSON library sees them as numbers.
    Inf,
    NegInf,
    Nan,
}

/// One step of a property path: a string key or an array index.
#[derive(Debug, Clone, PartialEq)]
pub enum PathKey {
    String(String),
    Index(usize),
}

impl PathKey {
    fn from_json(value: &JsonValue) -> Result<Self, WireError> {
        if let Some(s) = value.as_str() {
            Ok(PathKey::String(s.to_string()))
        } else if let Some(n) = value.as_u64() {
            Ok(PathKey::Index(n as usize))
        } else {
            Err(WireError::Expression(
                "path element must be a string or a non-negative integer".into(),
            ))
        }
    }

    fn to_json(&self) -> JsonValue {
        match self {
            PathKey::String(s) => JsonValue::String(s.clone()),
            PathKey::Index(n) => JsonValue::Number(Number::from(*n)),
        }
    }
}

impl WireExpression {
    pub fn from_json(value: &JsonValue) -> Result<Self, WireError> {
        match value {
            JsonValue::Null => Ok(WireExpression::Null),
            JsonValue::Bool(b) => Ok(WireExpression::Bool(*b)),
            JsonValue::Number(n) => Ok(WireExpression::Number(n.clone())),
            JsonValue::String(s) => Ok(WireExpression::String(s.clone())),
            JsonValue::Object(obj) => {
                let map = obj
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), WireExpression::from_json(v)?)))
                    .collect::<Result<HashMap<_, _>, WireError>>()?;
                Ok(WireExpression::Object(map))
            }
            JsonValue::Array(arr) => Self::from_json_array(arr),
        }
    }

    fn from_json_array(arr: &[JsonValue]) -> Result<Self, WireError> {
        // An escaped plain array: exactly one element, itself an array.
        if let [JsonValue::Array(inner)] = arr {
            let items = inner
                .iter()
                .map(WireExpression::from_json)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(WireExpression::EscapedArray(items));
        }

        let tag = match arr.first() {
            Some(JsonValue::String(tag)) => tag.as_str(),
            _ => {
                warn!(?arr, "array is neither escaped nor a special form");
                return Err(WireError::Expression(
                    "bare arrays are not allowed on the wire".into(),
                ));
            }
        };

        trace!(tag, len = arr.len(), "parsing special form");

        let int_at = |i: usize| -> Result<i64, WireError> {
            arr.get(i)
                .and_then(|v| v.as_i64())
                .ok_or_else(|| WireError::Expression(format!("{} id must be an integer", tag)))
        };

        match (tag, arr.len()) {
            ("export", 2) => Ok(WireExpression::Export(int_at(1)?)),
            ("import", 2) => Ok(WireExpression::Import(int_at(1)?)),
            ("promise", 2) => Ok(WireExpression::Promise(int_at(1)?)),

            ("pipeline", 2..=4) => {
                let id = int_at(1)?;
                let path = arr
                    .get(2)
                    .map(|v| {
                        v.as_array()
                            .ok_or_else(|| WireError::Expression("pipeline path must be an array".into()))?
                            .iter()
                            .map(PathKey::from_json)
                            .collect::<Result<Vec<_>, _>>()
                    })
                    .transpose()?;
                let args = arr
                    .get(3)
                    .map(WireExpression::from_json)
                    .transpose()?
                    .map(Box::new);
                Ok(WireExpression::Pipeline { id, path, args })
            }

            ("error", 3..=4) => {
                let kind = arr[1]
                    .as_str()
                    .ok_or_else(|| WireError::Expression("error kind must be a string".into()))?
                    .to_string();
                let message = arr[2]
                    .as_str()
                    .ok_or_else(|| WireError::Expression("error message must be a string".into()))?
                    .to_string();
                let data = arr
                    .get(3)
                    .map(WireExpression::from_json)
                    .transpose()?
                    .map(Box::new);
                Ok(WireExpression::Error {
                    kind,
                    message,
                    data,
                })
            }

            ("bytes", 2) => {
                let encoded = arr[1]
                    .as_str()
                    .ok_or_else(|| WireError::Expression("bytes payload must be a string".into()))?;
                let raw = BASE64.decode(encoded).map_err(|e| {
                    WireError::Expression(format!("bytes payload is not valid base64: {}", e))
                })?;
                Ok(WireExpression::Bytes(Bytes::from(raw)))
            }

            ("date", 2) => {
                let millis = arr[1]
                    .as_f64()
                    .ok_or_else(|| WireError::Expression("date must carry a number".into()))?;
                Ok(WireExpression::Date(millis))
            }

            ("bigint", 2) => {
                let digits = arr[1]
                    .as_str()
                    .ok_or_else(|| WireError::Expression("bigint must carry a string".into()))?;
                if !is_decimal_string(digits) {
                    return Err(WireError::Expression(format!(
                        "bigint is not a decimal string: {:?}",
                        digits
                    )));
                }
                Ok(WireExpression::BigInt(digits.to_string()))
            }

            ("undefined", 1) => Ok(WireExpression::Undefined),
            ("inf", 1) => Ok(WireExpression::Inf),
            ("-inf", 1) => Ok(WireExpression::NegInf),
            ("nan", 1) => Ok(WireExpression::Nan),

            (tag, len) => {
                warn!(tag, len, "unknown or malformed special form");
                Err(WireError::Expression(format!(
                    "unknown or malformed special form: {:?} with {} elements",
                    tag, len
                )))
            }
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            WireExpression::Null => JsonValue::Null,
            WireExpression::Bool(b) => JsonValue::Bool(*b),
            WireExpression::Number(n) => JsonValue::Number(n.clone()),
            WireExpression::String(s) => JsonValue::String(s.clone()),

            WireExpression::EscapedArray(items) => JsonValue::Array(vec![JsonValue::Array(
                items.iter().map(|e| e.to_json()).collect(),
            )]),

            WireExpression::Object(map) => {
                JsonValue::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }

            WireExpression::Error {
                kind,
                message,
                data,
            } => {
                let mut arr = vec![
                    JsonValue::String("error".into()),
                    JsonValue::String(kind.clone()),
                    JsonValue::String(message.clone()),
                ];
                if let Some(d) = data {
                    arr.push(d.to_json());
                }
                JsonValue::Array(arr)
            }

            WireExpression::Export(id) => tagged_id("export", *id),
            WireExpression::Import(id) => tagged_id("import", *id),
            WireExpression::Promise(id) => tagged_id("promise", *id),

            WireExpression::Pipeline { id, path, args } => {
                let mut arr = vec![JsonValue::String("pipeline".into()), (*id).into()];
                match (path, args) {
                    (Some(p), _) => {
                        arr.push(JsonValue::Array(p.iter().map(|k| k.to_json()).collect()));
                        if let Some(a) = args {
                            arr.push(a.to_json());
                        }
                    }
                    (None, Some(a)) => {
                        // Args with no walk still need the path position.
                        arr.push(JsonValue::Array(vec![]));
                        arr.push(a.to_json());
                    }
                    (None, None) => {}
                }
                JsonValue::Array(arr)
            }

            WireExpression::Bytes(raw) => JsonValue::Array(vec![
                JsonValue::String("bytes".into()),
                JsonValue::String(BASE64.encode(raw)),
            ]),

            WireExpression::Date(millis) => JsonValue::Array(vec![
                JsonValue::String("date".into()),
                JsonValue::Number(
                    Number::from_f64(*millis).unwrap_or_else(|| Number::from(0)),
                ),
            ]),

            WireExpression::BigInt(digits) => JsonValue::Array(vec![
                JsonValue::String("bigint".into()),
                JsonValue::String(digits.clone()),
            ]),

            WireExpression::Undefined => JsonValue::Array(vec![JsonValue::String("undefined".into())]),
            WireExpression::Inf => JsonValue::Array(vec![JsonValue::String("inf".into())]),
            WireExpression::NegInf => JsonValue::Array(vec![JsonValue::String("-inf".into())]),
            WireExpression::Nan => JsonValue::Array(vec![JsonValue::String("nan".into())]),
        }
    }
}

fn tagged_id(tag: &str, id: i64) -> JsonValue {
    JsonValue::Array(vec![JsonValue::String(tag.into()), id.into()])
}

fn is_decimal_string(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && (digits == "0" || !digits.starts_with('0'))
}

/// Parse a newline-delimited batch of frames.
pub fn parse_batch(input: &str) -> Result<Vec<Message>, WireError> {
    let mut messages = Vec::new();
    for (idx, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let json: JsonValue = serde_json::from_str(line).map_err(|e| WireError::Json {
            line: idx + 1,
            detail: e.to_string(),
        })?;
        messages.push(Message::from_json(&json)?);
    }
    trace!(count = messages.len(), "parsed batch");
    Ok(messages)
}

/// Serialize frames to newline-delimited form.
pub fn serialize_batch(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| m.to_json().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Serialize a single frame to its one-line JSON form.
pub fn serialize_frame(message: &Message) -> String {
    message.to_json().to_string()
}
