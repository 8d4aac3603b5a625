//! Transport layer for terminal sessions.
//!
//! Provides:
//! - Wire protocol (tagged JSON frames)
//! - `ConnectionHub` - Fan-out from sessions to push-channel clients
//! - `AppContext` - Registry, hub, and reaper owned together
//! - HTTP API and WebSocket transport (feature: websocket)

pub mod context;
pub mod hub;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod api;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use context::AppContext;
pub use hub::{ClientConnection, ConnectionHub, ConnectionId, HubSink};
pub use protocol::{ClientMessage, ServerMessage};

#[cfg(feature = "websocket")]
pub use api::{ApiError, router};
