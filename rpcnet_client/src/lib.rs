//! `rpcnet_client`
//!
//! Client-side systems:
//! - Connection management: PSK handshake, correlation table, heartbeats
//! - Zone-aware routing across multiple server connections
//! - Async-stream consumption for server-streamed methods

pub mod connection;
pub mod manager;
pub mod stream;

pub use connection::{ClientConnection, ClientState};
pub use manager::ConnectionManager;
pub use stream::AsyncStream;
