//! Transport layer for the session execution relay.
//!
//! Provides:
//! - Wire protocol (tagged JSON)
//! - Connection tracking with heartbeat liveness
//! - Axum WebSocket handler bridging connections to the relay

pub mod connection;
pub mod protocol;
pub mod websocket;

pub use connection::{ConnectionHandle, ConnectionManager, HeartbeatConfig};
pub use protocol::{ClientMessage, ServerMessage};
pub use websocket::{WsState, ws_router};
