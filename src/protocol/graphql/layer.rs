//! Operation multiplexing for one `graphql-ws` connection.
//!
//! # Responsibilities
//! - Track the connection state machine (Idle → Active → Closing → Closed)
//! - Own the registry of active subscriptions keyed by client id
//! - Pump each subscription's stream to the client on its own task
//! - Cancel everything on stop, terminate and close
//!
//! # Design Decisions
//! - Each subscription gets a `CancellationToken` that is handed to the
//!   producer and selected on by the pump, so cancellation reaches both
//! - A registry entry carries a sequence number; a pump only removes the
//!   entry it created, never a later subscription that reused the id
//! - The entry is removed before the terminal message goes out, so a client
//!   that reacts to `complete` by reusing the id is accepted

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::messages::{ClientMessage, OperationPayload, ServerMessage};
use crate::net::connection::ConnectionHandle;
use crate::observability::metrics;
use crate::protocol::{ConnectionContext, HandlerError};

/// Results produced by one subscription.
pub type OperationStream = BoxStream<'static, Result<Value, HandlerError>>;

/// Business logic behind a `graphql-ws` route.
#[async_trait]
pub trait OperationHandler: Send + Sync + 'static {
    async fn on_connect(&self, _ctx: &ConnectionContext) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Accept or refuse `connection_init`.
    async fn on_init(
        &self,
        _ctx: &ConnectionContext,
        _payload: Option<Value>,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Start a subscription. `cancel` fires when the client stops it or the
    /// connection closes.
    async fn subscribe(
        &self,
        ctx: &ConnectionContext,
        payload: OperationPayload,
        cancel: CancellationToken,
    ) -> Result<OperationStream, HandlerError>;

    async fn on_close(&self, _ctx: &ConnectionContext) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    Idle,
    Active,
    Closing,
    Closed,
}

#[derive(Debug)]
struct ActiveSubscription {
    seq: u64,
    cancel: CancellationToken,
}

type Registry = Arc<Mutex<HashMap<String, ActiveSubscription>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<String, ActiveSubscription>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove `id` only if it still names subscription `seq`.
fn finish(registry: &Registry, id: &str, seq: u64) -> bool {
    let mut subs = lock(registry);
    match subs.get(id) {
        Some(sub) if sub.seq == seq => {
            subs.remove(id);
            true
        }
        _ => false,
    }
}

fn send(out: &ConnectionHandle, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(text) => out.send_text(text),
        Err(err) => {
            tracing::error!(connection_id = %out.id(), error = %err, "Failed to encode message");
            false
        }
    }
}

pub struct OperationLayer<H> {
    handler: Arc<H>,
    ctx: Arc<ConnectionContext>,
    out: ConnectionHandle,
    state: LayerState,
    registry: Registry,
    next_seq: u64,
}

impl<H: OperationHandler> OperationLayer<H> {
    pub fn new(handler: Arc<H>, ctx: Arc<ConnectionContext>, out: ConnectionHandle) -> Self {
        Self {
            handler,
            ctx,
            out,
            state: LayerState::Idle,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_seq: 0,
        }
    }

    pub fn state(&self) -> LayerState {
        self.state
    }

    pub fn context(&self) -> &Arc<ConnectionContext> {
        &self.ctx
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn active_subscriptions(&self) -> usize {
        lock(&self.registry).len()
    }

    /// Dispatch one inbound frame.
    pub async fn handle(&mut self, text: &str) -> Result<ControlFlow<()>, HandlerError> {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                let err = HandlerError::from(err);
                tracing::debug!(connection_id = %self.ctx.id, error = %err, "Unparsable message");
                send(&self.out, &ServerMessage::error(None, err.to_string()));
                return Ok(ControlFlow::Continue(()));
            }
        };

        match message {
            ClientMessage::ConnectionInit { payload } => return self.init(payload).await,
            ClientMessage::Subscribe { id, payload } => self.subscribe(id, payload).await,
            ClientMessage::Stop { id } => self.stop(&id),
            ClientMessage::ConnectionTerminate => {
                tracing::debug!(connection_id = %self.ctx.id, "Client terminated connection");
                self.close();
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn init(&mut self, payload: Option<Value>) -> Result<ControlFlow<()>, HandlerError> {
        if self.state != LayerState::Idle {
            send(&self.out, &ServerMessage::error(None, "connection already initialised"));
            return Ok(ControlFlow::Continue(()));
        }

        match self.handler.on_init(&self.ctx, payload).await {
            Ok(()) => {
                self.state = LayerState::Active;
                send(&self.out, &ServerMessage::ConnectionAck);
                tracing::debug!(connection_id = %self.ctx.id, "Connection acknowledged");
                Ok(ControlFlow::Continue(()))
            }
            Err(err) => {
                tracing::info!(connection_id = %self.ctx.id, error = %err, "Connection init rejected");
                send(&self.out, &ServerMessage::connection_error(err.to_string()));
                Ok(ControlFlow::Break(()))
            }
        }
    }

    async fn subscribe(&mut self, id: String, payload: OperationPayload) {
        if self.state != LayerState::Active {
            send(&self.out, &ServerMessage::error(Some(id), "connection not initialised"));
            return;
        }
        if lock(&self.registry).contains_key(&id) {
            tracing::debug!(connection_id = %self.ctx.id, subscription_id = %id, "Duplicate subscription id");
            send(
                &self.out,
                &ServerMessage::error(Some(id.clone()), format!("subscription {id} already exists")),
            );
            return;
        }

        let cancel = CancellationToken::new();
        let stream = match self.handler.subscribe(&self.ctx, payload, cancel.clone()).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(connection_id = %self.ctx.id, subscription_id = %id, error = %err, "Subscription failed to start");
                send(&self.out, &ServerMessage::error(Some(id), err.to_string()));
                return;
            }
        };

        self.next_seq += 1;
        let seq = self.next_seq;
        lock(&self.registry).insert(
            id.clone(),
            ActiveSubscription {
                seq,
                cancel: cancel.clone(),
            },
        );
        metrics::subscription_opened();
        tracing::debug!(connection_id = %self.ctx.id, subscription_id = %id, "Subscription started");

        tokio::spawn(pump(id, seq, stream, cancel, self.registry.clone(), self.out.clone()));
    }

    fn stop(&mut self, id: &str) {
        let removed = lock(&self.registry).remove(id);
        if let Some(sub) = removed {
            sub.cancel.cancel();
            tracing::debug!(connection_id = %self.ctx.id, subscription_id = %id, "Subscription stopped by client");
        }
    }

    /// Cancel every subscription. Later calls are no-ops.
    pub fn close(&mut self) {
        if matches!(self.state, LayerState::Closing | LayerState::Closed) {
            return;
        }
        self.state = LayerState::Closing;

        let drained: Vec<(String, ActiveSubscription)> = lock(&self.registry).drain().collect();
        if !drained.is_empty() {
            tracing::debug!(connection_id = %self.ctx.id, subscriptions = drained.len(), "Cancelling subscriptions");
        }
        for (_, sub) in drained {
            sub.cancel.cancel();
        }

        self.state = LayerState::Closed;
    }
}

async fn pump(
    id: String,
    seq: u64,
    mut stream: OperationStream,
    cancel: CancellationToken,
    registry: Registry,
    out: ConnectionHandle,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = stream.next() => match item {
                Some(Ok(payload)) => {
                    if !send(&out, &ServerMessage::Next { id: id.clone(), payload }) {
                        finish(&registry, &id, seq);
                        break;
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(connection_id = %out.id(), subscription_id = %id, error = %err, "Subscription failed");
                    if finish(&registry, &id, seq) {
                        send(&out, &ServerMessage::error(Some(id.clone()), err.to_string()));
                    }
                    break;
                }
                None => {
                    if finish(&registry, &id, seq) {
                        send(&out, &ServerMessage::Complete { id: id.clone() });
                    }
                    break;
                }
            },
        }
    }
    metrics::subscription_closed();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::stream;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::net::connection::{ConnectionId, Outbound};
    use crate::protocol::{ConnectionState, RequestContext};

    /// Feeds are keyed by query text; `cancelled` reports queries whose token fired.
    struct Recorder {
        feeds: Mutex<HashMap<String, mpsc::UnboundedSender<Value>>>,
        cancelled: mpsc::UnboundedSender<String>,
        reject_init: bool,
    }

    #[async_trait]
    impl OperationHandler for Recorder {
        async fn on_init(&self, _ctx: &ConnectionContext, _payload: Option<Value>) -> Result<(), HandlerError> {
            if self.reject_init {
                return Err(HandlerError::new("unauthorised"));
            }
            Ok(())
        }

        async fn subscribe(
            &self,
            _ctx: &ConnectionContext,
            payload: OperationPayload,
            cancel: CancellationToken,
        ) -> Result<OperationStream, HandlerError> {
            match payload.query.as_str() {
                "broken" => Err(HandlerError::new("unknown field")),
                "finite" => Ok(stream::iter([Ok(json!(1)), Ok(json!(2))]).boxed()),
                "failing" => Ok(stream::iter([Err(HandlerError::new("boom"))]).boxed()),
                label => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    self.feeds.lock().unwrap().insert(label.to_string(), tx);

                    let hook = self.cancelled.clone();
                    let label = label.to_string();
                    tokio::spawn(async move {
                        cancel.cancelled().await;
                        let _ = hook.send(label);
                    });

                    Ok(stream::unfold(rx, |mut rx| async move {
                        rx.recv().await.map(|value| (Ok(value), rx))
                    })
                    .boxed())
                }
            }
        }
    }

    struct Harness {
        layer: OperationLayer<Recorder>,
        out: mpsc::UnboundedReceiver<Outbound>,
        cancelled: mpsc::UnboundedReceiver<String>,
    }

    impl Harness {
        fn new(reject_init: bool) -> Self {
            let (hook, cancelled) = mpsc::unbounded_channel();
            let handler = Arc::new(Recorder {
                feeds: Mutex::new(HashMap::new()),
                cancelled: hook,
                reject_init,
            });
            let ctx = Arc::new(ConnectionContext {
                id: ConnectionId::new(),
                route: "/chat".into(),
                request: RequestContext::default(),
                state: ConnectionState::new(),
                protocol: "graphql-ws".into(),
            });
            let (handle, out) = ConnectionHandle::new(ctx.id);
            Self {
                layer: OperationLayer::new(handler, ctx, handle),
                out,
                cancelled,
            }
        }

        async fn send(&mut self, message: Value) -> ControlFlow<()> {
            self.layer.handle(&message.to_string()).await.unwrap()
        }

        async fn recv(&mut self) -> Value {
            let frame = tokio::time::timeout(Duration::from_secs(1), self.out.recv())
                .await
                .expect("timed out waiting for a frame")
                .expect("outbound channel closed");
            match frame {
                Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
                other => panic!("unexpected frame {other:?}"),
            }
        }

        async fn assert_silent(&mut self) {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(self.out.try_recv().is_err());
        }

        async fn init(&mut self) {
            self.send(json!({ "type": "connection_init" })).await;
            assert_eq!(self.recv().await["type"], "connection_ack");
        }

        async fn subscribe(&mut self, id: &str, query: &str) {
            self.send(json!({ "type": "subscribe", "id": id, "payload": { "query": query } }))
                .await;
        }

        fn feed(&self, label: &str, value: Value) {
            self.layer.handler().feeds.lock().unwrap()[label].send(value).unwrap();
        }
    }

    #[tokio::test]
    async fn test_init_is_acknowledged_once() {
        let mut h = Harness::new(false);
        h.init().await;
        assert_eq!(h.layer.state(), LayerState::Active);

        h.send(json!({ "type": "connection_init" })).await;
        let reply = h.recv().await;
        assert_eq!(reply["type"], "error");
        assert!(reply.get("id").is_none());
    }

    #[tokio::test]
    async fn test_rejected_init_ends_connection() {
        let mut h = Harness::new(true);
        let flow = h.send(json!({ "type": "connection_init" })).await;
        assert!(flow.is_break());
        let reply = h.recv().await;
        assert_eq!(reply["type"], "connection_error");
        assert_eq!(reply["payload"]["message"], "unauthorised");
    }

    #[tokio::test]
    async fn test_subscribe_before_init_is_refused() {
        let mut h = Harness::new(false);
        h.subscribe("1", "live").await;
        let reply = h.recv().await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["id"], "1");
        assert_eq!(h.layer.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_finite_stream_completes() {
        let mut h = Harness::new(false);
        h.init().await;
        h.send(json!({ "type": "start", "id": "f", "payload": { "query": "finite" } }))
            .await;

        assert_eq!(h.recv().await, json!({ "type": "next", "id": "f", "payload": 1 }));
        assert_eq!(h.recv().await, json!({ "type": "next", "id": "f", "payload": 2 }));
        assert_eq!(h.recv().await, json!({ "type": "complete", "id": "f" }));
        assert_eq!(h.layer.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_stream_error_is_reported() {
        let mut h = Harness::new(false);
        h.init().await;
        h.subscribe("e", "failing").await;

        let reply = h.recv().await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["id"], "e");
        assert_eq!(reply["payload"][0]["message"], "boom");
        h.assert_silent().await;
        assert_eq!(h.layer.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_resolver_failure_is_reported() {
        let mut h = Harness::new(false);
        h.init().await;
        h.subscribe("b", "broken").await;

        let reply = h.recv().await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["id"], "b");
        assert_eq!(h.layer.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_leaves_original_running() {
        let mut h = Harness::new(false);
        h.init().await;
        h.subscribe("1", "first").await;
        h.subscribe("1", "second").await;

        let reply = h.recv().await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["id"], "1");
        assert_eq!(h.layer.active_subscriptions(), 1);

        h.feed("first", json!({ "tick": 1 }));
        assert_eq!(
            h.recv().await,
            json!({ "type": "next", "id": "1", "payload": { "tick": 1 } })
        );
    }

    #[tokio::test]
    async fn test_stop_cancels_producer_once() {
        let mut h = Harness::new(false);
        h.init().await;
        h.subscribe("1", "live").await;

        h.send(json!({ "type": "stop", "id": "1" })).await;
        let fired = tokio::time::timeout(Duration::from_secs(1), h.cancelled.recv())
            .await
            .unwrap();
        assert_eq!(fired.as_deref(), Some("live"));
        assert_eq!(h.layer.active_subscriptions(), 0);

        h.send(json!({ "type": "stop", "id": "1" })).await;
        h.send(json!({ "type": "stop", "id": "never-started" })).await;
        h.assert_silent().await;
        assert!(h.cancelled.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_cancels_every_subscription() {
        let mut h = Harness::new(false);
        h.init().await;
        h.subscribe("a", "alpha").await;
        h.subscribe("b", "beta").await;
        assert_eq!(h.layer.active_subscriptions(), 2);

        h.layer.close();
        h.layer.close();
        assert_eq!(h.layer.state(), LayerState::Closed);
        assert_eq!(h.layer.active_subscriptions(), 0);

        let mut fired = Vec::new();
        for _ in 0..2 {
            let label = tokio::time::timeout(Duration::from_secs(1), h.cancelled.recv())
                .await
                .unwrap()
                .unwrap();
            fired.push(label);
        }
        fired.sort();
        assert_eq!(fired, ["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_terminate_breaks_loop() {
        let mut h = Harness::new(false);
        h.init().await;
        h.subscribe("a", "alpha").await;

        let flow = h.send(json!({ "type": "connection_terminate" })).await;
        assert!(flow.is_break());
        assert_eq!(h.layer.state(), LayerState::Closed);
    }

    #[tokio::test]
    async fn test_garbage_gets_error_without_id() {
        let mut h = Harness::new(false);
        let flow = h.layer.handle("{not json").await.unwrap();
        assert!(flow.is_continue());

        let reply = h.recv().await;
        assert_eq!(reply["type"], "error");
        assert!(reply.get("id").is_none());
        let message = reply["payload"][0]["message"].as_str().unwrap();
        assert!(message.starts_with("invalid JSON: "), "{message}");
        assert_eq!(h.layer.state(), LayerState::Idle);
    }
}
