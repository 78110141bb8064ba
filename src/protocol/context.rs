//! Per-request and per-connection context.

use std::collections::HashMap;

use axum::http::HeaderMap;

use crate::net::connection::ConnectionId;

/// State produced by a route's payload validator and carried for the
/// connection's lifetime.
pub type ConnectionState = serde_json::Map<String, serde_json::Value>;

/// What the acceptor knows about an upgrade request before the handshake.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Normalised request path.
    pub path: String,
    pub headers: HeaderMap,
    /// Parameters captured by the route pattern.
    pub params: HashMap<String, String>,
}

impl RequestContext {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Everything a protocol handle knows about its connection.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    /// Pattern of the route that accepted the connection.
    pub route: String,
    pub request: RequestContext,
    pub state: ConnectionState,
    /// Negotiated sub-protocol token.
    pub protocol: String,
}

impl ConnectionContext {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.request.param(name)
    }
}
