//! One-shot HTTP batches.
//!
//! A batch records pushes against the remote main capability, optionally
//! chaining pipelined operations onto earlier results, then sends everything
//! as one newline-delimited POST body. The response batch resolves every
//! slot. Batches carry plain values only; live capability passing needs a
//! WebSocket session ([`crate::WsClient`]).

use crate::client::ClientConfig;
use anyhow::Context;
use std::collections::HashMap;
use tracing::{debug, trace};
use webcap_core::value::Value;
use webcap_core::wire::{parse_batch, serialize_batch, Message, PathKey, WireExpression};
use webcap_core::{decode_plain, encode_plain, RpcError};

pub struct HttpBatchClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl HttpBatchClient {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.call_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(HttpBatchClient { http, config })
    }

    /// Start recording a batch.
    pub fn batch(&self) -> BatchBuilder<'_> {
        BatchBuilder {
            client: self,
            next_slot: 1,
            pushes: Vec::new(),
        }
    }

    /// Single call on the remote main capability.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        let mut batch = self.batch();
        let result = batch.call(method, args)?;
        let results = batch.execute().await?;
        results.get(&result).map_err(Into::into)
    }
}

/// Handle for one recorded operation's future result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingResult {
    slot: i64,
}

pub struct BatchBuilder<'a> {
    client: &'a HttpBatchClient,
    next_slot: i64,
    pushes: Vec<Message>,
}

impl<'a> BatchBuilder<'a> {
    fn record(
        &mut self,
        target: i64,
        path: Vec<PathKey>,
        args: Option<Vec<Value>>,
    ) -> anyhow::Result<PendingResult> {
        let args = args
            .map(|args| {
                args.iter()
                    .map(encode_plain)
                    .collect::<Result<Vec<_>, _>>()
                    .map(|encoded| Box::new(WireExpression::EscapedArray(encoded)))
            })
            .transpose()
            .context("unencodable argument")?;

        let slot = -self.next_slot;
        self.next_slot += 1;
        self.pushes.push(Message::Push(
            slot,
            WireExpression::Pipeline {
                id: target,
                path: Some(path),
                args,
            },
        ));
        Ok(PendingResult { slot })
    }

    /// Record a call on the remote main capability.
    pub fn call(&mut self, method: &str, args: Vec<Value>) -> anyhow::Result<PendingResult> {
        self.record(0, vec![PathKey::String(method.to_string())], Some(args))
    }

    /// Record a call on (a property path of) an earlier result, so the
    /// server feeds one result into the next without an extra round trip.
    pub fn pipeline(
        &mut self,
        base: &PendingResult,
        path: &[&str],
        method: &str,
        args: Vec<Value>,
    ) -> anyhow::Result<PendingResult> {
        let mut keys: Vec<PathKey> = path
            .iter()
            .map(|p| PathKey::String(p.to_string()))
            .collect();
        keys.push(PathKey::String(method.to_string()));
        self.record(base.slot, keys, Some(args))
    }

    /// Record a property walk on an earlier result.
    pub fn get(&mut self, base: &PendingResult, path: &[&str]) -> anyhow::Result<PendingResult> {
        let keys = path
            .iter()
            .map(|p| PathKey::String(p.to_string()))
            .collect();
        self.record(base.slot, keys, None)
    }

    /// Send the batch: all pushes, then pulls for every slot.
    pub async fn execute(self) -> anyhow::Result<BatchResults> {
        if self.pushes.is_empty() {
            return Ok(BatchResults {
                results: HashMap::new(),
            });
        }
        if self.pushes.len() > self.client.config.max_batch_size {
            anyhow::bail!(
                "batch size {} exceeds maximum {}",
                self.pushes.len(),
                self.client.config.max_batch_size
            );
        }

        let mut messages = self.pushes;
        let pulls: Vec<Message> = messages
            .iter()
            .filter_map(|m| match m {
                Message::Push(slot, _) => Some(Message::Pull(-slot)),
                _ => None,
            })
            .collect();
        messages.extend(pulls);

        let body = serialize_batch(&messages);
        debug!(
            url = %self.client.config.url,
            frames = messages.len(),
            "sending batch"
        );
        trace!(%body, "batch body");

        let response = self
            .client
            .http
            .post(&self.client.config.url)
            .header("Content-Type", "text/plain")
            .body(body)
            .send()
            .await
            .context("failed to send batch request")?;
        let status = response.status();
        let text = response.text().await.context("failed to read batch response")?;
        if !status.is_success() {
            anyhow::bail!("HTTP error {}: {}", status, text);
        }
        trace!(%text, "batch response");

        let mut results = HashMap::new();
        for frame in parse_batch(&text).context("malformed batch response")? {
            match frame {
                Message::Resolve(id, expr) => {
                    results.insert(id, decode_plain(&expr));
                }
                Message::Reject(id, expr) => {
                    let err = match decode_plain(&expr) {
                        Ok(Value::Error(err)) => err,
                        _ => RpcError::internal("malformed rejection"),
                    };
                    results.insert(id, Err(err));
                }
                Message::Abort(expr) => {
                    let err = match decode_plain(&expr) {
                        Ok(Value::Error(err)) => err,
                        _ => RpcError::internal("session aborted"),
                    };
                    anyhow::bail!("batch aborted by server: {}", err);
                }
                other => {
                    trace!(?other, "ignoring non-resolution frame in batch response");
                }
            }
        }
        Ok(BatchResults { results })
    }
}

/// The resolved batch.
pub struct BatchResults {
    results: HashMap<i64, Result<Value, RpcError>>,
}

impl BatchResults {
    pub fn get(&self, pending: &PendingResult) -> Result<Value, RpcError> {
        match self.results.get(&pending.slot) {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(err)) => Err(err.clone()),
            None => Err(RpcError::internal(format!(
                "no result for slot {}",
                pending.slot
            ))),
        }
    }

    pub fn contains(&self, pending: &PendingResult) -> bool {
        self.results.contains_key(&pending.slot)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_assigns_descending_slots_and_pipelines_reference_them() {
        let client = HttpBatchClient::new(ClientConfig::new("http://localhost/rpc")).unwrap();
        let mut batch = client.batch();

        let user = batch
            .call("getUser", vec![Value::String("alice".into())])
            .unwrap();
        let name = batch.get(&user, &["name"]).unwrap();
        assert_eq!(user, PendingResult { slot: -1 });
        assert_eq!(name, PendingResult { slot: -2 });

        let body = serialize_batch(&batch.pushes);
        assert_eq!(
            body,
            "[\"push\",-1,[\"pipeline\",0,[\"getUser\"],[[\"alice\"]]]]\n\
             [\"push\",-2,[\"pipeline\",-1,[\"name\"]]]"
        );
    }

    #[test]
    fn capabilities_are_refused_in_batch_arguments() {
        let client = HttpBatchClient::new(ClientConfig::new("http://localhost/rpc")).unwrap();
        let mut batch = client.batch();
        let err = batch
            .call(
                "register",
                vec![Value::Target(std::sync::Arc::new(
                    webcap_core::testing::EchoTarget::new(),
                ))],
            )
            .unwrap_err();
        assert!(err.to_string().contains("unencodable argument"));
    }
}
