//! Network layer for tapedeck
//!
//! HTTP/1.1 control API with bounded concurrency and WebSocket log streams.

mod connection_pool;
mod http;
mod router;
mod server;
mod websocket;

pub use connection_pool::{ConnectionLimit, ConnectionPermit};
pub use http::{error_response, json_response, status_for, HttpBody};
pub use router::{Router, StartRequest};
pub use server::{shutdown_signal, Server};
pub use websocket::stream_logs;

/// Time allowed for open connections to finish after sessions are stopped
pub const SHUTDOWN_TIMEOUT_MS: u64 = 5000;
