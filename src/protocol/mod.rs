//! Protocol handles: what runs on an accepted connection.
//!
//! # Data Flow
//! ```text
//! Upgrade accepted
//!     → HandlerFactory::create (one handle per connection)
//!     → run(): on_connect
//!     → inbound text frames, one at a time, in arrival order
//!     → handle(frame) → Continue | Break
//!     → shutdown + on_close (always)
//! ```
//!
//! # Design Decisions
//! - The factory states which sub-protocols it speaks; negotiation happens
//!   before a handle exists
//! - A frame is fully handled before the next one is read
//! - Teardown runs on every exit path, including handler errors

pub mod context;
pub mod graphql;

use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;

use crate::http::websocket::Connection;
use crate::net::connection::ConnectionHandle;

pub use context::{ConnectionContext, ConnectionState, RequestContext};

/// Errors raised while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Message(String),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// Builds protocol handles for one route.
pub trait HandlerFactory: Send + Sync + 'static {
    /// Sub-protocol tokens this handler speaks.
    fn protocols(&self) -> &[&str];

    /// Exact, case-sensitive token match.
    fn is_supported(&self, token: &str) -> bool {
        self.protocols().iter().any(|p| *p == token)
    }

    fn create(&self, ctx: Arc<ConnectionContext>, out: ConnectionHandle) -> Box<dyn ProtocolHandle>;
}

/// Per-connection protocol logic.
#[async_trait]
pub trait ProtocolHandle: Send {
    async fn on_connect(&mut self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Handle one inbound text frame. `Break` ends the connection normally.
    async fn handle(&mut self, message: String) -> Result<ControlFlow<()>, HandlerError>;

    /// Tear down protocol state. Called once the inbound stream ends.
    async fn shutdown(&mut self) {}

    /// Called last, after shutdown.
    async fn on_close(&mut self) {}
}

/// Drive a handle over a connection until the stream ends or the handle stops.
pub async fn run(
    handle: &mut dyn ProtocolHandle,
    connection: &mut Connection,
) -> Result<(), HandlerError> {
    let result = drive(handle, connection).await;
    handle.shutdown().await;
    handle.on_close().await;
    result
}

async fn drive(
    handle: &mut dyn ProtocolHandle,
    connection: &mut Connection,
) -> Result<(), HandlerError> {
    handle.on_connect().await?;

    while let Some(message) = connection.next_message().await {
        if handle.handle(message).await?.is_break() {
            break;
        }
    }
    Ok(())
}
