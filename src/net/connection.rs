//! Connection identity, outbound handle and close signals.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing and pool bookkeeping
//! - Give every component a cheap, cloneable way to write to a connection
//! - Model the close signals a client can observe
//!
//! # Design Decisions
//! - All outbound traffic goes through one channel drained by a writer task,
//!   so pings, protocol messages and close frames never race on the socket
//! - Close sends a frame then stops the reader; terminate drops the socket
//!   without a frame (dead peers get no goodbye)
//! - Both are idempotent: the writer acts on the first close only

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Close codes the gateway sends.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    NormalClosure = 1000,
    ProtocolError = 1002,
    InternalError = 1011,
    TryAgainLater = 1013,
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// A transport-level close frame: code plus optional reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseSignal {
    pub code: CloseCode,
    pub reason: Option<String>,
}

impl CloseSignal {
    pub const NORMAL_CLOSURE: CloseSignal = CloseSignal::new(CloseCode::NormalClosure);
    pub const PROTOCOL_ERROR: CloseSignal = CloseSignal::new(CloseCode::ProtocolError);
    pub const INTERNAL_ERROR: CloseSignal = CloseSignal::new(CloseCode::InternalError);
    pub const TRY_AGAIN_LATER: CloseSignal = CloseSignal::new(CloseCode::TryAgainLater);

    pub const fn new(code: CloseCode) -> Self {
        Self { code, reason: None }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// A frame queued for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close(CloseSignal),
}

/// Cloneable write side of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Cancelled once a close or terminate was requested; ends the reader.
    closing: CancellationToken,
    /// Cancelled on terminate; ends the writer without a close frame.
    killed: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its writer drains.
    pub fn new(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id,
            outbound,
            closing: CancellationToken::new(),
            killed: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a text frame. Returns false once the connection is closing.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        if self.closing.is_cancelled() {
            return false;
        }
        self.outbound.send(Outbound::Text(text.into())).is_ok()
    }

    /// Queue a liveness probe.
    pub fn ping(&self) -> bool {
        if self.closing.is_cancelled() {
            return false;
        }
        self.outbound.send(Outbound::Ping).is_ok()
    }

    /// Send a close frame and stop reading. Later calls are no-ops.
    pub fn close(&self, signal: CloseSignal) {
        if self.closing.is_cancelled() {
            return;
        }
        let _ = self.outbound.send(Outbound::Close(signal));
        self.closing.cancel();
    }

    /// Drop the connection without a close frame.
    pub fn terminate(&self) {
        self.killed.cancel();
        self.closing.cancel();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    pub fn is_terminated(&self) -> bool {
        self.killed.is_cancelled()
    }

    /// Resolves once close or terminate has been requested.
    pub async fn closed(&self) {
        self.closing.cancelled().await
    }

    pub(crate) fn killed(&self) -> CancellationToken {
        self.killed.clone()
    }
}
