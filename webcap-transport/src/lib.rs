//! Transports for the webcap protocol.
//!
//! The session core consumes a reliable, ordered, message-framed byte stream
//! in both directions; this crate supplies that contract over WebSocket (one
//! frame = one UTF-8 text message) and over in-memory channel pairs for
//! tests, plus [`drive`], the loop that pumps a session against a transport.

pub mod drive;
pub mod memory;
pub mod transport;
pub mod websocket;

pub use drive::drive;
pub use memory::{memory_pair, MemoryTransport};
pub use transport::{RpcTransport, TransportError};
pub use websocket::{WebSocketClient, WebSocketTransport};
