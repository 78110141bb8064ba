//! Shared utilities for gateway integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use ws_gateway::config::GatewayConfig;
use ws_gateway::lifecycle::Shutdown;
use ws_gateway::protocol::graphql::{GraphqlRoute, OperationHandler, OperationPayload, OperationStream};
use ws_gateway::protocol::{ConnectionContext, ConnectionState, HandlerError, RequestContext};
use ws_gateway::routing::{PayloadRejected, PayloadValidator, RouteTable};
use ws_gateway::WsServer;

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

/// Counts producers that are still alive.
struct ProducerGuard(Arc<AtomicUsize>);

impl ProducerGuard {
    fn new(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for ProducerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Emits `count` messages, or ticks every 20ms until cancelled when no count is given.
pub struct Chat {
    pub producers: Arc<AtomicUsize>,
}

#[async_trait]
impl OperationHandler for Chat {
    async fn subscribe(
        &self,
        ctx: &ConnectionContext,
        payload: OperationPayload,
        cancel: CancellationToken,
    ) -> Result<OperationStream, HandlerError> {
        if payload.query.contains("forbidden") {
            return Err(HandlerError::new("field 'forbidden' is not allowed"));
        }

        let count = payload.variables.as_ref().and_then(|v| v["count"].as_u64());
        let room = ctx.param("room").map(String::from);
        let user = ctx.state.get("user").cloned();
        let guard = ProducerGuard::new(self.producers.clone());

        let messages = stream::unfold((0u64, guard), move |(n, guard)| {
            let cancel = cancel.clone();
            let room = room.clone();
            let user = user.clone();
            async move {
                match count {
                    Some(count) if n >= count => return None,
                    Some(_) => {}
                    None => {
                        tokio::select! {
                            _ = cancel.cancelled() => return None,
                            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                        }
                    }
                }
                let value = json!({ "data": { "message": n, "room": room, "user": user } });
                Some((Ok(value), (n + 1, guard)))
            }
        });
        Ok(messages.boxed())
    }
}

fn room_validator(request: &RequestContext) -> Result<ConnectionState, PayloadRejected> {
    if request.param("room") == Some("forbidden") {
        return Err(PayloadRejected("room is closed".into()));
    }
    let mut state = ConnectionState::new();
    let user = request.header("x-user").unwrap_or("anonymous");
    state.insert("user".into(), Value::from(user));
    Ok(state)
}

/// Accepts every upgrade after a fixed delay.
pub struct SlowValidator(pub Duration);

#[async_trait]
impl PayloadValidator for SlowValidator {
    async fn validate(&self, _request: &RequestContext) -> Result<ConnectionState, PayloadRejected> {
        tokio::time::sleep(self.0).await;
        Ok(ConnectionState::new())
    }
}

/// Validation delay of the `/slow` route.
pub const SLOW_VALIDATION: Duration = Duration::from_millis(300);

/// Config with the given limits and a short drain deadline.
pub fn config(max_connections: usize, probes_per_cycle: usize, liveness_timeout_ms: u64) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.limits.max_connections = max_connections;
    config.limits.probes_per_cycle = probes_per_cycle;
    config.limits.liveness_timeout_ms = liveness_timeout_ms;
    config.shutdown.drain_timeout_secs = 2;
    config
}

pub struct TestGateway {
    pub addr: SocketAddr,
    pub server: WsServer,
    pub producers: Arc<AtomicUsize>,
    shutdown: Shutdown,
    task: JoinHandle<Result<(), std::io::Error>>,
}

impl TestGateway {
    /// Boot a gateway with `/chat`, `/rooms/:room` and `/slow` on an ephemeral port.
    pub async fn start(config: GatewayConfig) -> Self {
        let producers = Arc::new(AtomicUsize::new(0));
        let chat = Arc::new(Chat {
            producers: producers.clone(),
        });

        let mut routes = RouteTable::new();
        routes.register("/chat", GraphqlRoute::from_arc(chat.clone())).unwrap();
        routes
            .register_validated("/rooms/:room", GraphqlRoute::from_arc(chat.clone()), room_validator)
            .unwrap();
        routes
            .register_validated("/slow", GraphqlRoute::from_arc(chat), SlowValidator(SLOW_VALIDATION))
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = WsServer::new(config, routes);
        let shutdown = Shutdown::new();
        let task = tokio::spawn(server.clone().run(listener, shutdown.subscribe()));

        Self {
            addr,
            server,
            producers,
            shutdown,
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub async fn connect(&self, path: &str, protocols: &[&str]) -> Result<Client, WsError> {
        self.connect_with(path, protocols, &[]).await
    }

    pub async fn connect_with(
        &self,
        path: &str,
        protocols: &[&str],
        headers: &[(&'static str, &str)],
    ) -> Result<Client, WsError> {
        let mut request = self.url(path).into_client_request()?;
        if !protocols.is_empty() {
            request.headers_mut().insert(
                "sec-websocket-protocol",
                HeaderValue::from_str(&protocols.join(", ")).unwrap(),
            );
        }
        for (name, value) in headers {
            request
                .headers_mut()
                .insert(*name, HeaderValue::from_str(value).unwrap());
        }
        let (client, _response) = tokio_tungstenite::connect_async(request).await?;
        Ok(client)
    }

    /// Connect to `/chat` and complete `connection_init`.
    pub async fn connect_chat(&self) -> Client {
        let mut client = self.connect("/chat", &["graphql-ws"]).await.unwrap();
        send(&mut client, json!({ "type": "connection_init" })).await;
        assert_eq!(next_json(&mut client).await["type"], "connection_ack");
        client
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        let _ = tokio::time::timeout(WAIT, self.task).await;
    }
}

pub async fn send(client: &mut Client, message: Value) {
    client.send(Message::text(message.to_string())).await.unwrap();
}

/// Next text frame as JSON, skipping control frames.
pub async fn next_json(client: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection ended")
            .expect("read failed");
        match frame {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Read until the server's close frame and return its code.
pub async fn close_code(client: &mut Client) -> u16 {
    loop {
        let frame = tokio::time::timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for close")
            .expect("connection ended without a close frame")
            .expect("read failed");
        match frame {
            Message::Close(Some(frame)) => return frame.code.into(),
            Message::Close(None) => panic!("close frame without a code"),
            _ => continue,
        }
    }
}

/// Every frame read until the stream ends or fails.
pub async fn read_until_end(client: &mut Client) -> Vec<Message> {
    let mut frames = Vec::new();
    loop {
        let next = tokio::time::timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for the connection to end");
        match next {
            Some(Ok(frame)) => frames.push(frame),
            Some(Err(_)) | None => return frames,
        }
    }
}

/// HTTP status of a refused handshake.
pub fn refused_status(result: Result<Client, WsError>) -> u16 {
    match result {
        Err(WsError::Http(response)) => response.status().as_u16(),
        Err(other) => panic!("expected an HTTP refusal, got {other:?}"),
        Ok(_) => panic!("expected the handshake to be refused"),
    }
}

/// Poll `condition` until it holds or the wait expires.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
