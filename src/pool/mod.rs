//! Connection pool subsystem.
//!
//! # Data Flow
//! ```text
//! Route matched → pool for that route (created lazily by the server)
//!     → connection_pool.rs (admission check under one mutex)
//!     → heartbeat queue entry
//!     → PoolSlot held by the connection task
//!     → slot dropped on exit → entry removed
//! ```
//!
//! # Design Decisions
//! - One pool per route pattern, one mutex per pool
//! - The heartbeat queue doubles as the live set: admission counts its entries
//! - Slots are RAII guards so every exit path releases its place

pub mod connection_pool;

pub use connection_pool::{AdmissionError, ConnectionPool, PoolLimits, PoolSlot};
