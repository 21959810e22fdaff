//! Session state and the message dispatcher.
//!
//! A session is one long-lived conversation between two symmetric peers over
//! one framed transport. The session owns the two tables, the id allocator,
//! and the outbound frame queue; the transport driver feeds inbound frames to
//! [`RpcSession::handle_message`] strictly in order and forwards frames from
//! the outbound receiver to the wire. Evaluation of inbound pushes runs in
//! spawned tasks, so slow calls never stall dispatch.

use crate::error::{ErrorSanitizer, RpcError};
use crate::ids::{ExportId, IdAllocator, ImportId};
use crate::stub::Stub;
use crate::tables::{ExportTable, ImportTable, TableError};
use crate::value::Value;
use crate::wire::{Message, WireError, WireExpression};
use crate::RpcTarget;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, trace, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("table error: {0}")]
    Table(#[from] TableError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("session is not active")]
    NotActive,
}

/// Session tuning knobs set at construction.
#[derive(Clone, Default)]
pub struct SessionConfig {
    /// Per-call timeout for awaited stubs. Expiry fails the awaiter with a
    /// `canceled` error and releases the import; a resolution that still
    /// arrives afterwards is accepted silently and discarded.
    pub call_timeout: Option<Duration>,
    /// Rewrites outbound error bodies (e.g. to redact internals).
    pub sanitizer: Option<ErrorSanitizer>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SessionStatus {
    Active,
    Failed(RpcError),
    Closed,
}

/// The receiving half handed to the transport driver: outbound frames to
/// write, and a flag that flips when the session wants the transport closed.
pub struct SessionReceiver {
    pub outbound: mpsc::UnboundedReceiver<Message>,
    pub closed: watch::Receiver<bool>,
}

pub(crate) struct SessionInner {
    pub(crate) alloc: IdAllocator,
    pub(crate) imports: ImportTable,
    pub(crate) exports: ExportTable,
    pub(crate) config: SessionConfig,
    outbound: mpsc::UnboundedSender<Message>,
    /// Pushes recorded by stubs, waiting for the next flush.
    queued: Mutex<Vec<Message>>,
    /// Coalesced releases: wire id -> accumulated delta.
    pending_releases: Mutex<HashMap<i64, u32>>,
    release_tick_armed: AtomicBool,
    /// Serializes multi-frame flushes so they stay contiguous on the wire.
    write_gate: Mutex<()>,
    status: Mutex<SessionStatus>,
    closed_tx: watch::Sender<bool>,
    /// Inbound pushes currently evaluating.
    in_flight: AtomicUsize,
    settled: Notify,
}

/// One peer's half of a session.
#[derive(Clone)]
pub struct RpcSession {
    pub(crate) inner: Arc<SessionInner>,
}

impl RpcSession {
    /// Create a session hosting `main` as capability 0. The returned
    /// [`SessionReceiver`] must be wired to a transport.
    pub fn new(main: Arc<dyn RpcTarget>, config: SessionConfig) -> (Self, SessionReceiver) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let exports = ExportTable::new();
        exports.install_main(main);
        let session = RpcSession {
            inner: Arc::new(SessionInner {
                alloc: IdAllocator::new(),
                imports: ImportTable::new(),
                exports,
                config,
                outbound: outbound_tx,
                queued: Mutex::new(Vec::new()),
                pending_releases: Mutex::new(HashMap::new()),
                release_tick_armed: AtomicBool::new(false),
                write_gate: Mutex::new(()),
                status: Mutex::new(SessionStatus::Active),
                closed_tx,
                in_flight: AtomicUsize::new(0),
                settled: Notify::new(),
            }),
        };
        (
            session,
            SessionReceiver {
                outbound: outbound_rx,
                closed: closed_rx,
            },
        )
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn is_active(&self) -> bool {
        *self.inner.status.lock().unwrap() == SessionStatus::Active
    }

    /// A stub for the remote peer's main capability.
    pub fn main_stub(&self) -> Stub {
        Stub::new(self.downgrade(), ImportId::main())
    }

    /// One-shot call on the remote main capability.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.main_stub().invoke(method, args).await
    }

    /// Table sizes, for tests and introspection.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            imports: self.inner.imports.len(),
            exports: self.inner.exports.len(),
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Process one inbound frame. Frames must be fed in transport order.
    /// Fatal errors abort the session before returning.
    pub async fn handle_message(&self, msg: Message) -> Result<(), SessionError> {
        if !self.is_active() {
            trace!("frame after teardown, dropping");
            return Ok(());
        }
        match msg {
            Message::Push(wire_id, expr) => self.on_push(wire_id, expr),
            Message::Pull(wire_id) => self.on_pull(wire_id),
            Message::Resolve(wire_id, value) => self.on_resolution(wire_id, Ok(value)).await,
            Message::Reject(wire_id, error) => self.on_resolution(wire_id, Err(error)).await,
            Message::Release(wire_id, delta) => self.on_release(wire_id, delta),
            Message::Abort(error) => {
                let err = self
                    .decode_error(&error)
                    .unwrap_or_else(|| RpcError::internal("session aborted by peer"));
                warn!(%err, "peer aborted the session");
                self.fail(RpcError::canceled(format!("session aborted by peer: {}", err)));
                Ok(())
            }
        }
    }

    fn on_push(&self, wire_id: i64, expr: WireExpression) -> Result<(), SessionError> {
        if wire_id >= 0 {
            return Err(self.violation(format!("push id must be negative, got {}", wire_id)));
        }
        let slot = ExportId::from_push_wire(wire_id);
        trace!(%slot, "inbound push");
        if let Err(e) = self.inner.exports.insert_slot(slot) {
            return Err(self.violation(e.to_string()));
        }
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);

        let session = self.clone();
        tokio::spawn(async move {
            let outcome = session.evaluate(&expr).await;
            session.finish_push(slot, outcome);
        });
        Ok(())
    }

    /// Record a slot outcome and send the matching resolution. Every push
    /// gets exactly one resolve or reject unless the session dies first.
    fn finish_push(&self, slot: ExportId, outcome: Result<Value, RpcError>) {
        let inner = &self.inner;
        match inner.exports.complete_slot(slot, outcome.clone()) {
            Ok(()) => {
                let frame = match &outcome {
                    Ok(value) => match self.encode_value(value) {
                        Ok(wire) => Message::Resolve(slot.wire_resolution(), wire),
                        Err(err) => Message::Reject(slot.wire_resolution(), self.encode_error(&err)),
                    },
                    Err(err) => Message::Reject(slot.wire_resolution(), self.encode_error(err)),
                };
                self.send_now(frame);
            }
            Err(TableError::UnknownExport(_)) => {
                // Slot vanished: released by the peer or swept by teardown.
                debug!(%slot, "slot gone before completion");
            }
            Err(e) => {
                warn!(%slot, error = %e, "could not complete slot");
            }
        }
        if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            inner.settled.notify_waiters();
        }
    }

    fn on_pull(&self, wire_id: i64) -> Result<(), SessionError> {
        let key = ExportId::from_handle_wire(wire_id);
        if !self.inner.exports.contains(key) {
            return Err(self.violation(format!("pull for unknown slot {}", key)));
        }
        // Resolutions are sent eagerly when evaluation finishes, so a pull is
        // an idempotent no-op on a live slot.
        trace!(%key, "pull acknowledged");
        Ok(())
    }

    async fn on_resolution(
        &self,
        wire_id: i64,
        body: Result<WireExpression, WireExpression>,
    ) -> Result<(), SessionError> {
        let key = ImportId::from_resolution_wire(wire_id);
        let completed = match body {
            Ok(value_expr) => {
                // Decode failures here are codec errors, and fatal.
                let value = match self.evaluate(&value_expr).await {
                    Ok(v) => v,
                    Err(e) => return Err(self.violation(format!("bad resolve value: {}", e))),
                };
                self.inner.imports.resolve(key, value)
            }
            Err(error_expr) => {
                let Some(err) = self.decode_error(&error_expr) else {
                    return Err(self.violation("reject payload is not an error".into()));
                };
                self.inner.imports.reject(key, err)
            }
        };
        match completed {
            Ok(true) => {
                self.inner.settled.notify_waiters();
                Ok(())
            }
            Ok(false) => Ok(()), // released before resolution; dropped silently
            Err(e) => Err(self.violation(e.to_string())),
        }
    }

    fn on_release(&self, wire_id: i64, delta: u32) -> Result<(), SessionError> {
        let key = ExportId::from_handle_wire(wire_id);
        match self.inner.exports.release(key, delta) {
            Ok(Some(target)) => {
                debug!(%key, "export disposed by peer release");
                tokio::spawn(async move {
                    if let Err(e) = target.dispose().await {
                        warn!(error = %e, "dispose hook failed");
                    }
                });
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(self.violation(e.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    pub(crate) fn enqueue_push(&self, msg: Message) {
        self.inner.queued.lock().unwrap().push(msg);
    }

    /// Send everything recorded so far as one contiguous write burst:
    /// coalesced releases, then pushes in enqueue order, then the dependent
    /// pull, if any.
    pub(crate) fn flush(&self, pull: Option<Message>) {
        let inner = &self.inner;
        let _gate = inner.write_gate.lock().unwrap();
        let releases = Self::drain_releases(&inner.pending_releases);
        let pushes = std::mem::take(&mut *inner.queued.lock().unwrap());
        for (id, delta) in releases {
            let _ = inner.outbound.send(Message::Release(id, delta));
        }
        for msg in pushes {
            let _ = inner.outbound.send(msg);
        }
        if let Some(msg) = pull {
            let _ = inner.outbound.send(msg);
        }
    }

    pub(crate) fn send_now(&self, msg: Message) {
        let _gate = self.inner.write_gate.lock().unwrap();
        let _ = self.inner.outbound.send(msg);
    }

    fn drain_releases(pending: &Mutex<HashMap<i64, u32>>) -> Vec<(i64, u32)> {
        let mut map = pending.lock().unwrap();
        let mut out: Vec<(i64, u32)> = map.drain().collect();
        // Deterministic order keeps the wire reproducible.
        out.sort_unstable();
        out
    }

    /// Drop local import handles; at zero the release is queued for the next
    /// tick (coalesced per id, never surfaced to user code).
    pub(crate) fn release_import(&self, id: ImportId, handles: u32) {
        if id.is_main() {
            return;
        }
        if let Some((wire_id, delta)) = self.inner.imports.release_local(id, handles) {
            self.queue_release(wire_id, delta);
        }
    }

    fn queue_release(&self, wire_id: i64, delta: u32) {
        *self
            .inner
            .pending_releases
            .lock()
            .unwrap()
            .entry(wire_id)
            .or_insert(0) += delta;
        // Bounded batching: whatever is queued goes out within one tick.
        if !self.inner.release_tick_armed.swap(true, Ordering::SeqCst) {
            let session = self.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                session.inner.release_tick_armed.store(false, Ordering::SeqCst);
                session.flush_releases();
            });
        }
    }

    pub(crate) fn flush_releases(&self) {
        let inner = &self.inner;
        let _gate = inner.write_gate.lock().unwrap();
        for (id, delta) in Self::drain_releases(&inner.pending_releases) {
            let _ = inner.outbound.send(Message::Release(id, delta));
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Wait until every inbound push has resolved and none of our own
    /// awaited promises are pending.
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.settled.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0
                && self.inner.imports.pending_count() == 0
            {
                return;
            }
            notified.await;
        }
    }

    /// Wait until every inbound push has resolved. Used by batch endpoints,
    /// which complete after the last pending push resolves.
    pub async fn settle(&self) {
        loop {
            let notified = self.inner.settled.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Graceful close: drain in-flight work, flush releases, run the
    /// teardown sweep, and ask the transport to close.
    pub async fn close(&self) {
        self.drain().await;
        self.flush_releases();
        {
            let mut status = self.inner.status.lock().unwrap();
            if *status != SessionStatus::Active {
                return;
            }
            *status = SessionStatus::Closed;
        }
        debug!("session closing");
        self.teardown(RpcError::canceled("session closed"));
    }

    /// Session-fatal local error: flush releases, emit the abort frame, then
    /// tear down.
    pub fn abort(&self, err: RpcError) {
        {
            let mut status = self.inner.status.lock().unwrap();
            if *status != SessionStatus::Active {
                return;
            }
            *status = SessionStatus::Failed(err.clone());
        }
        warn!(%err, "aborting session");
        self.flush_releases();
        self.send_now(Message::Abort(self.encode_error(&err)));
        self.teardown(RpcError::canceled(format!("session aborted: {}", err)));
    }

    /// Transport died or the peer aborted: tear down without emitting
    /// anything.
    pub fn fail(&self, err: RpcError) {
        {
            let mut status = self.inner.status.lock().unwrap();
            if *status != SessionStatus::Active {
                return;
            }
            *status = SessionStatus::Failed(err.clone());
        }
        self.teardown(err);
    }

    /// The single ordered sweep: fail pending imports, dispose exports,
    /// close the transport.
    fn teardown(&self, err: RpcError) {
        self.inner.imports.fail_all(&err);
        for target in self.inner.exports.drain_targets() {
            tokio::spawn(async move {
                if let Err(e) = target.dispose().await {
                    warn!(error = %e, "dispose hook failed during teardown");
                }
            });
        }
        self.inner.settled.notify_waiters();
        let _ = self.inner.closed_tx.send(true);
    }

    fn violation(&self, detail: String) -> SessionError {
        let err = RpcError::bad_request(detail.clone());
        self.abort(err);
        SessionError::Protocol(detail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub imports: usize,
    pub exports: usize,
    pub in_flight: usize,
}
