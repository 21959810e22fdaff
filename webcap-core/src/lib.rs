//! Core runtime for a bidirectional, capability-passing RPC protocol over
//! JSON frames, with promise pipelining.
//!
//! The crate is transport-agnostic: it consumes a reliable, ordered,
//! message-framed stream in both directions (see [`session::SessionReceiver`]
//! for the outbound half) and exposes capabilities to user code through the
//! [`RpcTarget`] trait and [`stub::Stub`] handles.

pub mod codec;
pub mod error;
pub mod ids;
pub mod session;
pub mod stub;
pub mod tables;
pub mod testing;
pub mod value;
pub mod wire;

pub use codec::{decode_plain, encode_plain};
pub use error::{ErrorKind, ErrorSanitizer, RpcError};
pub use ids::{ExportId, IdAllocator, ImportId};
pub use session::{RpcSession, SessionConfig, SessionError, SessionReceiver, SessionStats};
pub use stub::Stub;
pub use tables::{ExportTable, ImportTable, TableError};
pub use value::{BigInt, Value};
pub use wire::{parse_batch, serialize_batch, serialize_frame, Message, PathKey, WireError, WireExpression};

pub use async_trait::async_trait;

/// A capability implementation.
///
/// Method names are resolved dynamically; names beginning with an underscore
/// and the names `dispose`/`dispatch` are reserved and refused before
/// reaching the target. `dispose` runs at most once, when the peer's last
/// reference is released or the session tears down; errors from it are
/// logged and swallowed, never sent to the peer.
#[async_trait]
pub trait RpcTarget: Send + Sync + std::fmt::Debug {
    /// Invoke a method on this capability.
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError>;

    /// Read a property of this capability.
    async fn get_property(&self, property: &str) -> Result<Value, RpcError> {
        Err(RpcError::not_found(format!(
            "unknown property {:?}",
            property
        )))
    }

    /// Lifecycle hook invoked when the capability is dropped from the
    /// exports table.
    async fn dispose(&self) -> Result<(), RpcError> {
        Ok(())
    }
}
