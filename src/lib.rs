//! WebSocket upgrade gateway.
//!
//! Accepts HTTP upgrade requests, routes them to sub-protocol handlers,
//! caps live connections per route, probes peers for liveness and runs the
//! `graphql-ws` subscription protocol.

pub mod config;
pub mod heartbeat;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod pool;
pub mod protocol;
pub mod routing;

pub use config::GatewayConfig;
pub use http::WsServer;
pub use lifecycle::Shutdown;
pub use net::connection::{CloseCode, CloseSignal};
pub use routing::RouteTable;
