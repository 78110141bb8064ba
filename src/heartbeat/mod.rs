//! Liveness probing subsystem.
//!
//! # Data Flow
//! ```text
//! Connection admitted
//!     → schedule.rs (entry with deadline = now + liveness_timeout)
//!
//! Every sweep interval (monitor.rs):
//!     → take up to probes_per_cycle due entries
//!     → silent since last probe? terminate
//!     → otherwise re-arm and ping
//!
//! Pong received:
//!     → schedule.rs marks the entry responded
//! ```
//!
//! # Design Decisions
//! - interval = liveness_timeout / (max_connections / probes_per_cycle),
//!   so a full pool is covered once per timeout
//! - Per-sweep work is bounded by the probe budget, not the pool size
//! - One monitor task per pool; sweeps never overlap

pub mod monitor;
pub mod schedule;

pub use monitor::HeartbeatMonitor;
pub use schedule::{ExpiryQueue, SweepReport};
