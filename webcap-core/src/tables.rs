//! The import and export tables.
//!
//! Imports are entries whose value this peer consumes: pending promises from
//! its own pushes (negative keys) and capabilities or promises offered by the
//! remote (positive keys). Exports are entries this peer fulfills: result
//! slots created by remote pushes (positive keys) and capabilities it hosts
//! and has offered (negative keys). See `ids` for the sign conventions.
//!
//! Table state is shared between the dispatch task and evaluation tasks, so
//! entries live in `DashMap`s with atomic refcounts. Waiting is done through
//! oneshot senders (imports) and watch channels (export slots).

use crate::error::RpcError;
use crate::ids::{ExportId, IdAllocator, ImportId};
use crate::value::Value;
use crate::RpcTarget;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TableError {
    #[error("duplicate import id {0}")]
    DuplicateImport(ImportId),

    #[error("unknown import id {0}")]
    UnknownImport(ImportId),

    #[error("import {0} resolved twice")]
    ImportAlreadyResolved(ImportId),

    #[error("duplicate export id {0}")]
    DuplicateExport(ExportId),

    #[error("unknown export id {0}")]
    UnknownExport(ExportId),

    #[error("slot {0} completed twice")]
    SlotAlreadyCompleted(ExportId),

    #[error("release of {0} exceeds its refcount")]
    OverRelease(ExportId),

    #[error("the main capability is never released")]
    MainNotReleasable,
}

// ---------------------------------------------------------------------------
// Imports
// ---------------------------------------------------------------------------

enum ImportState {
    Pending(Vec<oneshot::Sender<Result<Value, RpcError>>>),
    Resolved(Value),
    Rejected(RpcError),
}

struct ImportEntry {
    /// Live local handles (stubs). The entry dies when this reaches zero.
    refcount: AtomicU32,
    /// How many times the reference arrived over the wire; this is the delta
    /// reported in the outbound release so the peer's export count reaches
    /// zero too. Local `dup` handles do not inflate it.
    wire_refs: AtomicU32,
    state: Mutex<ImportState>,
}

pub struct ImportTable {
    entries: DashMap<ImportId, ImportEntry>,
}

impl ImportTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register the pending result slot of one of our own pushes.
    pub fn insert_pending(&self, id: ImportId) -> Result<(), TableError> {
        self.insert(id, ImportState::Pending(Vec::new()))
    }

    /// Register a capability the peer offered. The entry is born resolved to
    /// the given value (normally the stub wrapping it).
    pub fn insert_offer(&self, id: ImportId, value: Value) -> Result<(), TableError> {
        self.insert(id, ImportState::Resolved(value))
    }

    /// Register a promise the peer offered; resolved by a later frame.
    pub fn insert_promise(&self, id: ImportId) -> Result<(), TableError> {
        self.insert(id, ImportState::Pending(Vec::new()))
    }

    fn insert(&self, id: ImportId, state: ImportState) -> Result<(), TableError> {
        let entry = ImportEntry {
            refcount: AtomicU32::new(1),
            wire_refs: AtomicU32::new(1),
            state: Mutex::new(state),
        };
        if self.entries.insert(id, entry).is_some() {
            return Err(TableError::DuplicateImport(id));
        }
        Ok(())
    }

    pub fn contains(&self, id: ImportId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Count another arrival of an already-known reference.
    pub fn add_wire_ref(&self, id: ImportId) -> Result<(), TableError> {
        let entry = self
            .entries
            .get(&id)
            .ok_or(TableError::UnknownImport(id))?;
        entry.refcount.fetch_add(1, Ordering::SeqCst);
        entry.wire_refs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Count a local duplicate handle (does not affect the wire delta).
    pub fn add_local_ref(&self, id: ImportId) -> Result<(), TableError> {
        self.entries
            .get(&id)
            .map(|entry| {
                entry.refcount.fetch_add(1, Ordering::SeqCst);
            })
            .ok_or(TableError::UnknownImport(id))
    }

    /// Complete a pending entry. Returns false when the id is gone (already
    /// released locally: a late resolution, accepted silently). A second
    /// resolution of a live entry is a protocol error.
    pub fn resolve(&self, id: ImportId, value: Value) -> Result<bool, TableError> {
        self.complete(id, Ok(value))
    }

    pub fn reject(&self, id: ImportId, error: RpcError) -> Result<bool, TableError> {
        self.complete(id, Err(error))
    }

    fn complete(&self, id: ImportId, outcome: Result<Value, RpcError>) -> Result<bool, TableError> {
        let Some(entry) = self.entries.get(&id) else {
            debug!(%id, "late resolution for a released import, dropping");
            return Ok(false);
        };
        let mut state = entry.state.lock().unwrap();
        let waiters = match &mut *state {
            ImportState::Pending(waiters) => std::mem::take(waiters),
            _ => return Err(TableError::ImportAlreadyResolved(id)),
        };
        *state = match &outcome {
            Ok(value) => ImportState::Resolved(value.clone()),
            Err(err) => ImportState::Rejected(err.clone()),
        };
        drop(state);
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        Ok(true)
    }

    /// Wait for the entry's resolution. Resolved entries return immediately;
    /// pending entries register a oneshot waiter, woken exactly once.
    pub async fn await_value(&self, id: ImportId) -> Result<Value, RpcError> {
        let rx = {
            let entry = self.entries.get(&id).ok_or_else(|| {
                RpcError::cap_revoked(format!("{} is not in the imports table", id))
            })?;
            let mut state = entry.state.lock().unwrap();
            match &mut *state {
                ImportState::Resolved(value) => return Ok(value.clone()),
                ImportState::Rejected(err) => return Err(err.clone()),
                ImportState::Pending(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
            }
        };
        rx.await
            .unwrap_or_else(|_| Err(RpcError::canceled("session torn down")))
    }

    /// Snapshot of a resolved entry, if any.
    pub fn peek(&self, id: ImportId) -> Option<Result<Value, RpcError>> {
        let entry = self.entries.get(&id)?;
        let state = entry.state.lock().unwrap();
        match &*state {
            ImportState::Resolved(value) => Some(Ok(value.clone())),
            ImportState::Rejected(err) => Some(Err(err.clone())),
            ImportState::Pending(_) => None,
        }
    }

    pub fn is_pending(&self, id: ImportId) -> bool {
        self.entries
            .get(&id)
            .map(|entry| matches!(*entry.state.lock().unwrap(), ImportState::Pending(_)))
            .unwrap_or(false)
    }

    /// Drop local handles. At zero the entry is removed and the wire handle
    /// plus accumulated delta to report to the peer is returned.
    pub fn release_local(&self, id: ImportId, handles: u32) -> Option<(i64, u32)> {
        let entry = self.entries.get(&id)?;
        let before = entry.refcount.fetch_sub(handles, Ordering::SeqCst);
        if before > handles {
            return None;
        }
        if before < handles {
            warn!(%id, before, handles, "import released below zero");
        }
        drop(entry);
        let (_, entry) = self.entries.remove(&id)?;
        let delta = entry.wire_refs.load(Ordering::SeqCst);
        debug!(%id, delta, "import released, reporting to peer");
        Some((id.wire_handle(), delta))
    }

    /// Teardown sweep: fail every pending entry and clear the table.
    pub fn fail_all(&self, err: &RpcError) {
        let ids: Vec<ImportId> = self.entries.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                let mut state = entry.state.lock().unwrap();
                if let ImportState::Pending(waiters) = &mut *state {
                    for waiter in std::mem::take(waiters) {
                        let _ = waiter.send(Err(err.clone()));
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(*e.state.lock().unwrap(), ImportState::Pending(_)))
            .count()
    }
}

impl Default for ImportTable {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Exports
// ---------------------------------------------------------------------------

type SlotOutcome = Option<Result<Value, RpcError>>;

enum ExportEntry {
    /// A capability we host. Refcount tracks outstanding peer references:
    /// incremented on every send, decremented by inbound release deltas.
    Target {
        target: Arc<dyn RpcTarget>,
        refcount: AtomicU32,
    },
    /// A result slot created by a remote push. The watch cell lets pipelined
    /// evaluations wait for completion.
    Slot {
        refcount: AtomicU32,
        cell: watch::Sender<SlotOutcome>,
    },
}

/// What a reference resolution found.
pub enum ExportRef {
    Target(Arc<dyn RpcTarget>),
    Slot(watch::Receiver<SlotOutcome>),
}

pub struct ExportTable {
    entries: DashMap<ExportId, ExportEntry>,
    /// Interning index: target pointer -> existing export id.
    by_ptr: DashMap<usize, ExportId>,
}

fn target_key(target: &Arc<dyn RpcTarget>) -> usize {
    Arc::as_ptr(target) as *const () as usize
}

impl ExportTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            by_ptr: DashMap::new(),
        }
    }

    /// Install the main capability at id 0. It is implicitly present and
    /// never released; the refcount here is inert.
    pub fn install_main(&self, target: Arc<dyn RpcTarget>) {
        self.entries.insert(
            ExportId::main(),
            ExportEntry::Target {
                target,
                refcount: AtomicU32::new(1),
            },
        );
    }

    /// Intern a hosted capability for sending. Re-sending an already-exported
    /// target reuses its id and bumps the refcount by one.
    pub fn intern(&self, target: &Arc<dyn RpcTarget>, alloc: &IdAllocator) -> ExportId {
        let key = target_key(target);
        if let Some(id) = self.by_ptr.get(&key).map(|e| *e.value()) {
            if let Some(entry) = self.entries.get(&id) {
                if let ExportEntry::Target { refcount, .. } = entry.value() {
                    refcount.fetch_add(1, Ordering::SeqCst);
                    return id;
                }
            }
        }
        let id = alloc.next_offer();
        self.entries.insert(
            id,
            ExportEntry::Target {
                target: target.clone(),
                refcount: AtomicU32::new(1),
            },
        );
        self.by_ptr.insert(key, id);
        debug!(%id, "exported capability");
        id
    }

    /// Create the result slot for an inbound push.
    pub fn insert_slot(&self, id: ExportId) -> Result<(), TableError> {
        let (tx, _rx) = watch::channel(None);
        let entry = ExportEntry::Slot {
            refcount: AtomicU32::new(1),
            cell: tx,
        };
        if self.entries.insert(id, entry).is_some() {
            return Err(TableError::DuplicateExport(id));
        }
        Ok(())
    }

    /// Record the slot's outcome and wake pipelined waiters. Completing a
    /// slot twice is a protocol error (every push resolves exactly once).
    pub fn complete_slot(
        &self,
        id: ExportId,
        outcome: Result<Value, RpcError>,
    ) -> Result<(), TableError> {
        let entry = self.entries.get(&id).ok_or(TableError::UnknownExport(id))?;
        match entry.value() {
            ExportEntry::Slot { cell, .. } => {
                if cell.borrow().is_some() {
                    return Err(TableError::SlotAlreadyCompleted(id));
                }
                let _ = cell.send(Some(outcome));
                Ok(())
            }
            ExportEntry::Target { .. } => Err(TableError::SlotAlreadyCompleted(id)),
        }
    }

    /// Resolve a reference to either the hosted target or a slot receiver.
    pub fn get(&self, id: ExportId) -> Option<ExportRef> {
        self.entries.get(&id).map(|entry| match entry.value() {
            ExportEntry::Target { target, .. } => ExportRef::Target(target.clone()),
            ExportEntry::Slot { cell, .. } => ExportRef::Slot(cell.subscribe()),
        })
    }

    pub fn contains(&self, id: ExportId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Apply an inbound release. Unknown ids and deltas larger than the
    /// refcount are protocol violations. At zero the entry is removed and a
    /// hosted target is handed back so its dispose hook can run (at most
    /// once: removal is the guard).
    pub fn release(
        &self,
        id: ExportId,
        delta: u32,
    ) -> Result<Option<Arc<dyn RpcTarget>>, TableError> {
        if id.is_main() {
            return Err(TableError::MainNotReleasable);
        }
        let remove = {
            let entry = self.entries.get(&id).ok_or(TableError::UnknownExport(id))?;
            let refcount = match entry.value() {
                ExportEntry::Target { refcount, .. } => refcount,
                ExportEntry::Slot { refcount, .. } => refcount,
            };
            let mut current = refcount.load(Ordering::SeqCst);
            loop {
                if delta > current {
                    return Err(TableError::OverRelease(id));
                }
                match refcount.compare_exchange(
                    current,
                    current - delta,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => break current - delta == 0,
                    Err(seen) => current = seen,
                }
            }
        };
        if !remove {
            return Ok(None);
        }
        let Some((_, entry)) = self.entries.remove(&id) else {
            return Ok(None);
        };
        debug!(%id, "export released");
        match entry {
            ExportEntry::Target { target, .. } => {
                self.by_ptr.remove(&target_key(&target));
                Ok(Some(target))
            }
            ExportEntry::Slot { .. } => Ok(None),
        }
    }

    /// Teardown sweep: clear the table and hand back every hosted target so
    /// dispose hooks still run.
    pub fn drain_targets(&self) -> Vec<Arc<dyn RpcTarget>> {
        self.by_ptr.clear();
        let ids: Vec<ExportId> = self.entries.iter().map(|e| *e.key()).collect();
        let mut targets = Vec::new();
        for id in ids {
            if let Some((_, ExportEntry::Target { target, .. })) = self.entries.remove(&id) {
                if !id.is_main() {
                    targets.push(target);
                }
            }
        }
        targets
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ExportTable {
    fn default() -> Self {
        Self::new()
    }
}
