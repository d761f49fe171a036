//! WebSocket module for the kittyparty server
//!
//! Handles client sessions, the per-user room registry and the JSON message
//! types exchanged over the socket.

mod messages;
mod registry;
mod session;

pub use messages::{ClientMessage, ServerMessage};
pub use registry::{ConnectionId, RoomRegistry};
pub use session::{websocket_route, WebSocketSession};
