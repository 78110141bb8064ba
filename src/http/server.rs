//! HTTP server setup and gateway state.
//!
//! # Responsibilities
//! - Create the Axum router that sends every path to the upgrade acceptor
//! - Own the route table and the per-route connection pools
//! - Serve a listener until shutdown, then dispose the gateway
//!
//! # Design Decisions
//! - Pools are created lazily on the first accepted upgrade for a route
//! - Disposal is idempotent and never blocks past the drain deadline
//! - No pool is created once disposal has begun

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{routing::any, Router};
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::config::GatewayConfig;
use crate::http::upgrade::{upgrade_handler, UpgradeError};
use crate::net::connection::CloseSignal;
use crate::pool::{ConnectionPool, PoolLimits};
use crate::routing::{Route, RouteTable};

struct ServerState {
    config: GatewayConfig,
    routes: RouteTable,
    pools: DashMap<String, Arc<ConnectionPool>>,
    accepting: AtomicBool,
    disposed: AtomicBool,
}

/// The WebSocket gateway. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WsServer {
    inner: Arc<ServerState>,
}

impl WsServer {
    pub fn new(config: GatewayConfig, routes: RouteTable) -> Self {
        Self {
            inner: Arc::new(ServerState {
                config,
                routes,
                pools: DashMap::new(),
                accepting: AtomicBool::new(true),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn routes(&self) -> &RouteTable {
        &self.inner.routes
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Pool for `route`, created (with its heartbeat) on first use.
    ///
    /// Refused once disposal has begun. The flag is read under the map's
    /// entry lock, so disposal either sees the new pool or this call sees
    /// the flag.
    pub(crate) fn pool_for(&self, route: &Route) -> Result<Arc<ConnectionPool>, UpgradeError> {
        let entry = self.inner.pools.entry(route.pattern().to_string());
        if !self.is_accepting() {
            return Err(UpgradeError::ShuttingDown);
        }

        let pool = entry
            .or_insert_with(|| {
                let limits = PoolLimits::from(&self.inner.config.limits);
                let pool = ConnectionPool::new(route.pattern(), limits);
                pool.spawn_heartbeat();
                tracing::info!(
                    route = %route.pattern(),
                    max_connections = limits.max_connections,
                    "Connection pool created"
                );
                pool
            })
            .clone();
        Ok(pool)
    }

    /// Live connections on the route registered as `pattern`.
    pub fn live_connections(&self, pattern: &str) -> usize {
        self.inner
            .pools
            .get(pattern)
            .map(|pool| pool.live_connections())
            .unwrap_or(0)
    }

    /// Build the Axum router.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/{*path}", any(upgrade_handler))
            .route("/", any(upgrade_handler))
            .with_state(self.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Serve `listener` until `shutdown` fires, then dispose.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, routes = self.inner.routes.len(), "WebSocket gateway starting");

        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        let server = self.clone();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received, disposing gateway");
                server.dispose().await;
            })
            .await?;

        tracing::info!("WebSocket gateway stopped");
        Ok(())
    }

    /// Stop accepting, close every pooled connection and wait for them to drain.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.accepting.store(false, Ordering::SeqCst);

        let pools: Vec<Arc<ConnectionPool>> =
            self.inner.pools.iter().map(|entry| entry.value().clone()).collect();
        for pool in &pools {
            pool.close_all(CloseSignal::NORMAL_CLOSURE);
        }

        let deadline = self.inner.config.shutdown.drain_timeout();
        let drains = pools.iter().map(|pool| async move {
            match tokio::time::timeout(deadline, pool.drained()).await {
                Ok(()) => tracing::debug!(route = %pool.route(), "Pool drained"),
                Err(_) => tracing::warn!(
                    route = %pool.route(),
                    remaining = pool.live_connections(),
                    "Pool did not drain before deadline"
                ),
            }
        });
        join_all(drains).await;

        for pool in &pools {
            pool.shutdown();
        }
        tracing::info!(pools = pools.len(), "Gateway disposed");
    }
}
