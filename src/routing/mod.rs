//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Upgrade request path
//!     → router.rs (route lookup, registration order)
//!     → matcher.rs (segment comparison, :param capture)
//!     → Return: matched Route or None
//!
//! Route registration (at startup):
//!     (pattern, handler factory, validator?)
//!     → compile pattern
//!     → reject duplicates
//!     → freeze inside the server
//! ```
//!
//! # Design Decisions
//! - Routes registered before serving, immutable at runtime
//! - No regex in hot path
//! - Deterministic: same path always matches the same route
//! - First match wins (registration order)

pub mod matcher;
pub mod router;

pub use matcher::{Matcher, PathPattern, PatternError};
pub use router::{PayloadRejected, PayloadValidator, Route, RouteError, RouteTable};
