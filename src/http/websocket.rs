//! WebSocket frame plumbing for accepted connections.
//!
//! # Responsibilities
//! - Own the socket sink in a single writer task
//! - Turn inbound frames into text messages for the protocol handle
//! - Route pongs to the pool's liveness tracking
//!
//! # Data Flow
//! ```text
//! ConnectionHandle ──→ mpsc ──→ write_loop ──→ socket sink
//! socket stream ──→ Connection::next_message ──→ ProtocolHandle
//!                       └── pong ──→ ConnectionPool::record_pong
//! ```
//!
//! # Design Decisions
//! - A close frame ends the writer; nothing is sent after it
//! - Termination ends the writer without a close frame
//! - Pings from the client are answered by the WebSocket layer itself

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::net::connection::{ConnectionHandle, Outbound};
use crate::pool::ConnectionPool;

/// Drain queued frames into the socket until a close frame or termination.
///
/// The sink is only closed after a close frame went out. On termination it
/// is dropped as is, since closing it would emit an empty close frame.
pub async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    killed: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = killed.cancelled() => return,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };

        let (message, last) = match frame {
            Outbound::Text(text) => (Message::Text(text.into()), false),
            Outbound::Ping => (Message::Ping(Default::default()), false),
            Outbound::Close(signal) => (
                Message::Close(Some(CloseFrame {
                    code: signal.code.as_u16(),
                    reason: signal.reason.unwrap_or_default().into(),
                })),
                true,
            ),
        };

        if let Err(err) = sink.send(message).await {
            tracing::debug!(error = %err, "WebSocket write failed");
            return;
        }
        if last {
            break;
        }
    }

    if !killed.is_cancelled() {
        let _ = sink.close().await;
    }
}

/// Read side of an accepted connection.
pub struct Connection {
    inbound: SplitStream<WebSocket>,
    handle: ConnectionHandle,
    pool: Arc<ConnectionPool>,
}

impl Connection {
    pub fn new(inbound: SplitStream<WebSocket>, handle: ConnectionHandle, pool: Arc<ConnectionPool>) -> Self {
        Self {
            inbound,
            handle,
            pool,
        }
    }

    /// Next text message, or `None` once the connection is closed or closing.
    pub async fn next_message(&mut self) -> Option<String> {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.handle.closed() => return None,
                frame = self.inbound.next() => frame,
            };

            match frame? {
                Ok(Message::Text(text)) => return Some(text.as_str().to_owned()),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(text),
                    Err(_) => {
                        tracing::debug!(connection_id = %self.handle.id(), "Dropping non UTF-8 binary frame");
                    }
                },
                Ok(Message::Pong(_)) => self.pool.record_pong(self.handle.id()),
                Ok(Message::Ping(_)) => {}
                Ok(Message::Close(frame)) => {
                    tracing::debug!(
                        connection_id = %self.handle.id(),
                        code = ?frame.as_ref().map(|f| f.code),
                        "Client closed connection"
                    );
                    return None;
                }
                Err(err) => {
                    tracing::debug!(connection_id = %self.handle.id(), error = %err, "WebSocket read failed");
                    return None;
                }
            }
        }
    }
}
