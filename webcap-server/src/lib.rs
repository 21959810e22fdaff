//! Server glue: serves webcap sessions over WebSocket and HTTP batch from
//! one axum router.

pub mod logging;
pub mod server;

pub use logging::{init_logging, init_test_logging};
pub use server::{process_batch, Server, ServerConfig};
