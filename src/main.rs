//! WebSocket gateway binary.
//!
//! Serves a demo `graphql-ws` route at `/graphql/:channel` whose
//! subscriptions stream a ticking counter.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use ws_gateway::config::{load_config, GatewayConfig};
use ws_gateway::lifecycle::{shutdown_signal, Shutdown};
use ws_gateway::observability::{logging, metrics};
use ws_gateway::protocol::graphql::{GraphqlRoute, OperationHandler, OperationPayload, OperationStream};
use ws_gateway::protocol::{ConnectionContext, ConnectionState, HandlerError, RequestContext};
use ws_gateway::routing::{PayloadRejected, RouteTable};
use ws_gateway::WsServer;

#[derive(Debug, Parser)]
#[command(name = "ws-gateway", version, about = "WebSocket upgrade gateway")]
struct Cli {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// Streams `{ tick, channel }` every `intervalMs` until stopped or `count` is reached.
struct Ticker;

#[async_trait]
impl OperationHandler for Ticker {
    async fn subscribe(
        &self,
        ctx: &ConnectionContext,
        payload: OperationPayload,
        cancel: CancellationToken,
    ) -> Result<OperationStream, HandlerError> {
        let variables = payload.variables.unwrap_or(Value::Null);
        let interval = Duration::from_millis(variables["intervalMs"].as_u64().unwrap_or(1000).max(10));
        let limit = variables["count"].as_u64();
        let channel = ctx.param("channel").unwrap_or_default().to_string();

        let ticks = stream::unfold(0u64, move |tick| {
            let cancel = cancel.clone();
            let channel = channel.clone();
            async move {
                if limit.is_some_and(|limit| tick >= limit) {
                    return None;
                }
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    _ = tokio::time::sleep(interval) => {
                        let value = json!({ "data": { "tick": tick, "channel": channel } });
                        Some((Ok(value), tick + 1))
                    }
                }
            }
        });
        Ok(ticks.boxed())
    }
}

fn channel_name(request: &RequestContext) -> Result<ConnectionState, PayloadRejected> {
    let channel = request.param("channel").unwrap_or_default();
    if channel.is_empty() || !channel.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(PayloadRejected(format!("invalid channel '{channel}'")));
    }
    let mut state = ConnectionState::new();
    state.insert("channel".into(), Value::from(channel));
    Ok(state)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "ws-gateway starting");

    if config.observability.metrics_enabled {
        let addr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr)?;
    }

    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.limits.max_connections,
        probes_per_cycle = config.limits.probes_per_cycle,
        liveness_timeout_ms = config.limits.liveness_timeout_ms,
        "Configuration loaded"
    );

    let mut routes = RouteTable::new();
    routes.register_validated("/graphql/:channel", GraphqlRoute::new(Ticker), channel_name)?;

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    let server = WsServer::new(config, routes);
    let serving = tokio::spawn(server.run(listener, shutdown.subscribe()));

    shutdown_signal().await;
    shutdown.trigger();
    serving.await??;

    tracing::info!("Shutdown complete");
    Ok(())
}
