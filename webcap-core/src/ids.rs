//! Table keys and the session ID allocator.
//!
//! Every reference in a session is a signed 64-bit integer. Each peer keeps
//! two tables keyed in its own local space:
//!
//! * imports: entries whose value this peer consumes. Result slots of its
//!   own pushes sit at negative keys (it allocated them); capabilities and
//!   promises offered by the remote sit at positive keys.
//! * exports: entries this peer fulfills. Result slots of remote pushes sit
//!   at positive keys; capabilities this peer offered sit at negative keys.
//!
//! ID 0 is the main capability on both sides: implicitly present, never
//! allocated, never released. The sign split keeps the two allocators (one
//! per peer) collision-free within each table without any negotiation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Key into the imports table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImportId(pub i64);

impl ImportId {
    pub fn main() -> Self {
        ImportId(0)
    }

    pub fn is_main(&self) -> bool {
        self.0 == 0
    }

    /// True for result slots of our own pushes (we allocated the id).
    pub fn is_local_slot(&self) -> bool {
        self.0 < 0
    }

    /// True for capabilities or promises the remote offered us.
    pub fn is_remote_offer(&self) -> bool {
        self.0 > 0
    }

    /// The id written in `pull` and `release` frames for this entry.
    /// The receiver uses the value directly as an exports key.
    pub fn wire_handle(&self) -> i64 {
        -self.0
    }

    /// The id written in value-position forms (`pipeline`, `import`); the
    /// receiver negates.
    pub fn wire_ref(&self) -> i64 {
        self.0
    }

    /// Key named by an inbound `resolve`/`reject` frame (used as-is).
    pub fn from_resolution_wire(id: i64) -> Self {
        ImportId(id)
    }

    /// Key for an inbound `export`/`promise` value form (negated).
    pub fn from_offer_wire(id: i64) -> Self {
        ImportId(-id)
    }
}

impl fmt::Display for ImportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "import#{}", self.0)
    }
}

/// Key into the exports table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExportId(pub i64);

impl ExportId {
    pub fn main() -> Self {
        ExportId(0)
    }

    pub fn is_main(&self) -> bool {
        self.0 == 0
    }

    /// True for result slots created by remote pushes.
    pub fn is_remote_slot(&self) -> bool {
        self.0 > 0
    }

    /// True for capabilities we offered (we allocated the id).
    pub fn is_local_offer(&self) -> bool {
        self.0 < 0
    }

    /// The id written in `resolve`/`reject` frames for this entry. The
    /// receiver uses the value directly as an imports key.
    pub fn wire_resolution(&self) -> i64 {
        -self.0
    }

    /// The id written in value-position forms (`export`, `promise` offers);
    /// the receiver negates.
    pub fn wire_ref(&self) -> i64 {
        self.0
    }

    /// Key named by an inbound `push` frame (negated).
    pub fn from_push_wire(id: i64) -> Self {
        ExportId(-id)
    }

    /// Key named by an inbound `pull` or `release` frame (used as-is).
    pub fn from_handle_wire(id: i64) -> Self {
        ExportId(id)
    }

    /// Key for an inbound `import`/`pipeline` value form (negated).
    pub fn from_ref_wire(id: i64) -> Self {
        ExportId(-id)
    }
}

impl fmt::Display for ExportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "export#{}", self.0)
    }
}

/// Allocates the ids this peer introduces.
///
/// One monotonically increasing counter serves both pushed result slots and
/// offered capabilities; ids are never recycled, so a stale reference can
/// never alias a new entry. 0 is excluded (main).
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicI64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(1),
        }
    }

    /// Allocate the import key for a result slot we are about to push.
    /// The key is negative; the `push` frame carries the same value.
    pub fn next_slot(&self) -> ImportId {
        ImportId(-self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Allocate the export key for a capability we are about to offer.
    pub fn next_offer(&self) -> ExportId {
        ExportId(-self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_ids() {
        assert!(ImportId::main().is_main());
        assert!(ExportId::main().is_main());
        assert_eq!(ImportId::main().0, 0);
    }

    #[test]
    fn allocator_is_monotonic_and_shared() {
        let alloc = IdAllocator::new();
        assert_eq!(alloc.next_slot(), ImportId(-1));
        assert_eq!(alloc.next_offer(), ExportId(-2));
        assert_eq!(alloc.next_slot(), ImportId(-3));
    }

    #[test]
    fn slot_wire_forms() {
        // A pushed slot allocated as -1: the push frame carries -1, the
        // pull/release frames carry +1, and the peer's resolve carries -1.
        let slot = ImportId(-1);
        assert!(slot.is_local_slot());
        assert_eq!(slot.wire_ref(), -1);
        assert_eq!(slot.wire_handle(), 1);
        assert_eq!(ImportId::from_resolution_wire(-1), slot);

        // The receiving peer keys the same slot at +1 in its exports.
        let peer_key = ExportId::from_push_wire(-1);
        assert_eq!(peer_key, ExportId(1));
        assert_eq!(peer_key.wire_resolution(), -1);
        assert_eq!(ExportId::from_handle_wire(1), peer_key);
    }

    #[test]
    fn offer_wire_forms() {
        // A capability offered as -7: the export form carries -7, the
        // recipient keys it at +7 and releases it with -7 on the wire.
        let offer = ExportId(-7);
        assert!(offer.is_local_offer());
        assert_eq!(offer.wire_ref(), -7);

        let recipient = ImportId::from_offer_wire(-7);
        assert_eq!(recipient, ImportId(7));
        assert!(recipient.is_remote_offer());
        assert_eq!(recipient.wire_handle(), -7);
        assert_eq!(ExportId::from_handle_wire(-7), offer);

        // Referencing the offered capability in a pipeline carries +7; the
        // offering side negates back to its export key.
        assert_eq!(recipient.wire_ref(), 7);
        assert_eq!(ExportId::from_ref_wire(7), offer);
    }
}
