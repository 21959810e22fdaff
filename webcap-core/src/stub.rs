//! Client-side stubs and promise pipelining.
//!
//! A stub wraps an import id plus a property path; it is a tree-building
//! value object, never a closure. Property access extends the path without
//! touching the wire. A method call allocates a fresh result slot, records a
//! `push` (not yet flushed), and returns the promise stub for that slot, so
//! dependent calls chain into a single round trip. Awaiting a stub flushes
//! the recorded pushes followed by the dependent `pull` and completes when
//! the matching `resolve`/`reject` arrives.

use crate::error::RpcError;
use crate::ids::ImportId;
use crate::session::{RpcSession, SessionInner};
use crate::value::Value;
use crate::wire::{Message, PathKey, WireExpression};
use crate::RpcTarget;
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::trace;

/// A handle on a remote capability or a pipelined path into an unresolved
/// result.
#[derive(Clone)]
pub struct Stub {
    session: Weak<SessionInner>,
    import: ImportId,
    path: Vec<PathKey>,
}

impl Stub {
    pub(crate) fn new(session: Weak<SessionInner>, import: ImportId) -> Self {
        Stub {
            session,
            import,
            path: Vec::new(),
        }
    }

    pub fn import(&self) -> ImportId {
        self.import
    }

    pub fn path(&self) -> &[PathKey] {
        &self.path
    }

    pub(crate) fn belongs_to(&self, session: &RpcSession) -> bool {
        self.session
            .upgrade()
            .map(|inner| Arc::ptr_eq(&inner, &session.inner))
            .unwrap_or(false)
    }

    fn session(&self) -> Result<RpcSession, RpcError> {
        self.session
            .upgrade()
            .map(|inner| RpcSession { inner })
            .ok_or_else(|| RpcError::canceled("session closed"))
    }

    /// A stub for a property of this one. No traffic.
    pub fn get(&self, property: &str) -> Stub {
        let mut next = self.clone();
        next.path.push(PathKey::String(property.to_string()));
        next
    }

    /// A stub for an element of this one. No traffic.
    pub fn at(&self, index: usize) -> Stub {
        let mut next = self.clone();
        next.path.push(PathKey::Index(index));
        next
    }

    /// Duplicate the handle, bumping the root import's local refcount so
    /// each copy can be disposed independently.
    pub fn dup(&self) -> Result<Stub, RpcError> {
        if !self.import.is_main() {
            let session = self.session()?;
            session
                .inner
                .imports
                .add_local_ref(self.import)
                .map_err(|e| RpcError::cap_revoked(e.to_string()))?;
        }
        Ok(self.clone())
    }

    /// Record a method call. The push is enqueued but not flushed; the
    /// returned promise stub can immediately seed dependent calls.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Stub, RpcError> {
        let session = self.session()?;
        if !session.is_active() {
            return Err(RpcError::canceled("session is not active"));
        }

        let mut path = self.path.clone();
        path.push(PathKey::String(method.to_string()));

        let mut encoded_args = Vec::with_capacity(args.len());
        for arg in &args {
            encoded_args.push(session.encode_value(arg)?);
        }

        let slot = session.inner.alloc.next_slot();
        session
            .inner
            .imports
            .insert_pending(slot)
            .map_err(|e| RpcError::internal(e.to_string()))?;

        let expr = WireExpression::Pipeline {
            id: self.import.wire_ref(),
            path: Some(path),
            args: Some(Box::new(WireExpression::EscapedArray(encoded_args))),
        };
        trace!(root = %self.import, method, %slot, "recorded push");
        session.enqueue_push(Message::Push(slot.wire_ref(), expr));

        Ok(Stub::new(self.session.clone(), slot))
    }

    /// Call and await in one step.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.call(method, args)?.resolve().await
    }

    /// Await this stub's value, consuming the handle.
    ///
    /// Flushes recorded pushes plus the dependent pull. Promise slots are
    /// released once their value has been delivered (or the await failed);
    /// capability imports stay alive until [`Stub::dispose`].
    pub async fn resolve(self) -> Result<Value, RpcError> {
        let session = self.session()?;

        if self.path.is_empty() {
            if self.import.is_main() {
                return Ok(Value::Stub(self));
            }
            if self.import.is_local_slot() {
                session.flush(Some(Message::Pull(self.import.wire_handle())));
                let outcome = session.await_import(self.import).await;
                session.release_import(self.import, 1);
                return outcome;
            }
            // A capability or promise the peer offered us.
            if session.inner.imports.is_pending(self.import) {
                session.flush(Some(Message::Pull(self.import.wire_handle())));
            }
            return session.await_import(self.import).await;
        }

        // Path-extended: materialize the walk as its own slot.
        let slot = {
            let slot = session.inner.alloc.next_slot();
            session
                .inner
                .imports
                .insert_pending(slot)
                .map_err(|e| RpcError::internal(e.to_string()))?;
            let expr = WireExpression::Pipeline {
                id: self.import.wire_ref(),
                path: Some(self.path.clone()),
                args: None,
            };
            session.enqueue_push(Message::Push(slot.wire_ref(), expr));
            slot
        };
        session.flush(Some(Message::Pull(slot.wire_handle())));
        let outcome = session.await_import(slot).await;
        session.release_import(slot, 1);
        outcome
    }

    /// Drop this handle's reference on the root import. At refcount zero the
    /// release is reported to the peer, which may dispose the capability.
    pub fn dispose(self) {
        if self.import.is_main() {
            return;
        }
        if let Ok(session) = self.session() {
            session.release_import(self.import, 1);
        }
    }
}

/// A received stub can stand in anywhere a local capability does: calls and
/// property reads proxy back to the hosting peer.
#[async_trait]
impl RpcTarget for Stub {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.invoke(method, args).await
    }

    async fn get_property(&self, property: &str) -> Result<Value, RpcError> {
        self.get(property).resolve().await
    }
}

impl fmt::Debug for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stub")
            .field("import", &self.import)
            .field("path", &self.path)
            .finish()
    }
}

impl RpcSession {
    /// Await an import's resolution under the session's per-call timeout.
    pub(crate) async fn await_import(&self, id: ImportId) -> Result<Value, RpcError> {
        match self.inner.config.call_timeout {
            None => self.inner.imports.await_value(id).await,
            Some(limit) => match tokio::time::timeout(limit, self.inner.imports.await_value(id))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    // Advisory timeout: release our interest; a late
                    // resolution is accepted silently and discarded.
                    self.release_import(id, 1);
                    Err(RpcError::canceled(format!(
                        "call timed out after {:?}",
                        limit
                    )))
                }
            },
        }
    }
}
