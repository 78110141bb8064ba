//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     Broadcast → server stops accepting → pools close → drain → exit
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, close, drain, stop heartbeats
//! - Draining has a deadline; stragglers are logged, not awaited

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::shutdown_signal;
