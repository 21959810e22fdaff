//! Client surface: long-lived WebSocket sessions with full capability
//! support, and one-shot HTTP batches for plain-value calls.

pub mod batch;
pub mod client;

pub use batch::{BatchBuilder, BatchResults, HttpBatchClient, PendingResult};
pub use client::{ClientConfig, WsClient};
