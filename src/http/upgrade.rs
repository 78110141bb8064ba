//! Upgrade acceptor.
//!
//! # Responsibilities
//! - Normalise the request target and resolve it to a route
//! - Run the route's payload validator before the handshake
//! - Negotiate the sub-protocol and enforce the pool's admission cap
//! - Drive the protocol handle and close with the matching signal
//!
//! # Data Flow
//! ```text
//! HTTP request
//!     → normalise path ── fail → 400
//!     → accepting?     ── no   → 503
//!     → resolve route  ── none → 404
//!     → upgrade headers ─ bad  → 426
//!     → validator      ── fail → 400
//!     → pool           ── disposing → 503
//!     → handshake (101)
//!         → unsupported protocol → close 1002
//!         → pool full            → close 1013
//!         → run handle → close 1000 | 1011
//! ```
//!
//! # Design Decisions
//! - Faults before the handshake are plain HTTP errors; faults after it are
//!   close frames, so the client always sees one or the other
//! - When no offered token is supported the handshake still echoes the
//!   client's first token, otherwise standard clients fail the handshake
//!   and never observe the protocol-error close

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use url::Url;

use crate::http::server::WsServer;
use crate::http::websocket::{write_loop, Connection};
use crate::net::connection::{CloseSignal, ConnectionHandle, ConnectionId};
use crate::observability::metrics::{self, UpgradeOutcome};
use crate::pool::{AdmissionError, ConnectionPool};
use crate::protocol::{self, ConnectionContext, ConnectionState, RequestContext};
use crate::routing::Route;

/// How long the writer may take to flush its close frame.
const WRITER_GRACE: Duration = Duration::from_secs(5);

/// Reasons an upgrade request is refused before the handshake.
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("malformed request target: {0}")]
    MalformedUrl(#[from] url::ParseError),

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("no route for {0}")]
    RouteNotFound(String),

    #[error("not a WebSocket upgrade: {0}")]
    NotWebSocket(String),

    #[error("upgrade rejected: {0}")]
    Validation(String),
}

impl UpgradeError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MalformedUrl(_) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::RouteNotFound(_) => StatusCode::NOT_FOUND,
            Self::NotWebSocket(_) => StatusCode::UPGRADE_REQUIRED,
        }
    }

    fn outcome(&self) -> UpgradeOutcome {
        match self {
            Self::MalformedUrl(_) => UpgradeOutcome::MalformedUrl,
            Self::ShuttingDown => UpgradeOutcome::ShuttingDown,
            Self::RouteNotFound(_) => UpgradeOutcome::RouteNotFound,
            Self::NotWebSocket(_) | Self::Validation(_) => UpgradeOutcome::Rejected,
        }
    }
}

impl IntoResponse for UpgradeError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Resolve `target` against `http://localhost` and return the normalised path.
pub fn normalise_path(target: &str) -> Result<String, url::ParseError> {
    let base = Url::parse("http://localhost")?;
    let url = base.join(target)?;
    Ok(url.path().to_string())
}

/// Tokens from every `Sec-WebSocket-Protocol` header, in offer order.
pub fn offered_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(String::from)
        .collect()
}

/// Entry point for every request the gateway receives.
pub async fn upgrade_handler(
    State(server): State<WsServer>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    let path = match normalise_path(target) {
        Ok(path) => path,
        Err(err) => return refuse("none", target, UpgradeError::from(err)),
    };

    if !server.is_accepting() {
        return refuse("none", &path, UpgradeError::ShuttingDown);
    }

    let Some(route) = server.routes().resolve(&path) else {
        return refuse("none", &path, UpgradeError::RouteNotFound(path.clone()));
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            return refuse(
                route.pattern(),
                &path,
                UpgradeError::NotWebSocket(rejection.body_text()),
            )
        }
    };

    let request = RequestContext {
        params: route.params(&path),
        path,
        headers,
    };

    let state = match route.validator() {
        Some(validator) => match validator.validate(&request).await {
            Ok(state) => state,
            Err(rejected) => {
                return refuse(
                    route.pattern(),
                    &request.path,
                    UpgradeError::Validation(rejected.0),
                )
            }
        },
        None => ConnectionState::new(),
    };

    // Disposal may have begun while the validator ran.
    let pool = match server.pool_for(&route) {
        Ok(pool) => pool,
        Err(err) => return refuse(route.pattern(), &request.path, err),
    };

    let offered = offered_protocols(&request.headers);
    let supported = offered
        .iter()
        .find(|token| route.handler().is_supported(token))
        .cloned();

    let mut ws = ws;
    if let Some(token) = supported.clone().or_else(|| offered.first().cloned()) {
        ws = ws.protocols([token]);
    }

    tracing::debug!(
        peer = %peer,
        route = %route.pattern(),
        path = %request.path,
        protocol = ?supported,
        "Upgrading connection"
    );

    ws.on_failed_upgrade(|err| tracing::warn!(error = %err, "WebSocket handshake failed"))
        .on_upgrade(move |socket| serve_connection(socket, route, pool, request, state, supported))
}

fn refuse(route: &str, path: &str, err: UpgradeError) -> Response {
    match &err {
        UpgradeError::RouteNotFound(_) | UpgradeError::ShuttingDown => {
            tracing::info!(path = %path, error = %err, "Upgrade refused")
        }
        _ => tracing::warn!(route = %route, path = %path, error = %err, "Upgrade refused"),
    }
    metrics::record_upgrade(route, err.outcome());
    err.into_response()
}

/// Post-handshake driver for one connection.
async fn serve_connection(
    socket: WebSocket,
    route: Arc<Route>,
    pool: Arc<ConnectionPool>,
    request: RequestContext,
    state: ConnectionState,
    protocol: Option<String>,
) {
    let id = ConnectionId::new();
    let (handle, rx) = ConnectionHandle::new(id);
    let (sink, inbound) = socket.split();
    let writer = tokio::spawn(write_loop(sink, rx, handle.killed()));

    let Some(protocol) = protocol else {
        tracing::info!(connection_id = %id, route = %route.pattern(), "No supported sub-protocol offered");
        metrics::record_upgrade(route.pattern(), UpgradeOutcome::UnsupportedProtocol);
        handle.close(CloseSignal::PROTOCOL_ERROR.with_reason("unsupported sub-protocol"));
        finish(&handle, writer, WRITER_GRACE).await;
        return;
    };

    let slot = match pool.admit(handle.clone()) {
        Ok(slot) => slot,
        Err(err) => {
            tracing::info!(connection_id = %id, route = %route.pattern(), error = %err, "Connection not admitted");
            metrics::record_upgrade(route.pattern(), UpgradeOutcome::PoolFull);
            let reason = match err {
                AdmissionError::Full { .. } => "connection limit reached",
                AdmissionError::Closed => "server shutting down",
            };
            handle.close(CloseSignal::TRY_AGAIN_LATER.with_reason(reason));
            finish(&handle, writer, WRITER_GRACE).await;
            return;
        }
    };

    metrics::record_upgrade(route.pattern(), UpgradeOutcome::Accepted);
    tracing::info!(
        connection_id = %id,
        route = %route.pattern(),
        path = %request.path,
        protocol = %protocol,
        "Connection accepted"
    );

    let ctx = Arc::new(ConnectionContext {
        id,
        route: route.pattern().to_string(),
        request,
        state,
        protocol,
    });
    let mut protocol_handle = route.handler().create(ctx, handle.clone());
    let mut connection = Connection::new(inbound, handle.clone(), pool);

    match protocol::run(protocol_handle.as_mut(), &mut connection).await {
        Ok(()) => handle.close(CloseSignal::NORMAL_CLOSURE),
        Err(err) => {
            tracing::error!(connection_id = %id, route = %route.pattern(), error = %err, "Connection handler failed");
            handle.close(CloseSignal::INTERNAL_ERROR.with_reason(err.to_string()));
        }
    }

    drop(connection);
    finish(&handle, writer, WRITER_GRACE).await;
    drop(slot);
    tracing::debug!(connection_id = %id, "Connection finished");
}

/// Give the writer `grace` to flush, then abort it and drop the socket.
async fn finish(handle: &ConnectionHandle, mut writer: JoinHandle<()>, grace: Duration) {
    if tokio::time::timeout(grace, &mut writer).await.is_err() {
        tracing::debug!(connection_id = %handle.id(), "Writer did not finish in time");
        handle.terminate();
        writer.abort();
    }
}
