//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Upgraded WebSocket
//!     → connection.rs (id, outbound handle, close signals)
//!     → http/websocket.rs (writer task, inbound frame stream)
//!     → Hand off to the protocol layer
//!
//! Connection States:
//!     Handshaking → Admitted → Closing → Closed
//!                          ↘ Terminated (no close frame)
//! ```
//!
//! # Design Decisions
//! - One writer per connection owns the socket sink
//! - Every connection tracked by its pool for admission and shutdown

pub mod connection;

pub use connection::{CloseCode, CloseSignal, ConnectionHandle, ConnectionId, Outbound};
