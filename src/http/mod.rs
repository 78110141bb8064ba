//! HTTP and WebSocket handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, every path to the acceptor)
//!     → upgrade.rs (route, validate, negotiate, admit)
//!     → websocket.rs (reader + single writer per connection)
//!     → protocol handle
//! ```

pub mod server;
pub mod upgrade;
pub mod websocket;

pub use server::WsServer;
pub use upgrade::UpgradeError;
