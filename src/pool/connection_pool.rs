//! Per-route connection pool.
//!
//! # Responsibilities
//! - Admit connections up to the route's cap
//! - Own the heartbeat queue for those connections
//! - Close and drain every connection on shutdown
//! - Provide slot guards that release on drop

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::LimitsConfig;
use crate::heartbeat::{ExpiryQueue, HeartbeatMonitor, SweepReport};
use crate::net::connection::{CloseSignal, ConnectionHandle, ConnectionId};
use crate::observability::metrics;

/// Admission and liveness limits for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_connections: usize,
    pub probes_per_cycle: usize,
    pub liveness_timeout: Duration,
}

impl PoolLimits {
    /// Time between sweeps so a full pool is probed once per liveness timeout.
    pub fn sweep_interval(&self) -> Duration {
        let nanos = self.liveness_timeout.as_nanos() * self.probes_per_cycle.max(1) as u128
            / self.max_connections.max(1) as u128;
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)).max(Duration::from_millis(1))
    }
}

impl From<&LimitsConfig> for PoolLimits {
    fn from(config: &LimitsConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            probes_per_cycle: config.probes_per_cycle,
            liveness_timeout: config.liveness_timeout(),
        }
    }
}

/// Why a connection was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("connection limit of {max} reached")]
    Full { max: usize },
    #[error("pool is closing")]
    Closed,
}

#[derive(Debug, Default)]
struct PoolState {
    queue: ExpiryQueue,
    closing: bool,
}

/// Live connections of one route.
#[derive(Debug)]
pub struct ConnectionPool {
    route: String,
    limits: PoolLimits,
    state: Mutex<PoolState>,
    live: watch::Sender<usize>,
    heartbeat: CancellationToken,
}

impl ConnectionPool {
    pub fn new(route: impl Into<String>, limits: PoolLimits) -> Arc<Self> {
        let (live, _) = watch::channel(0);
        Arc::new(Self {
            route: route.into(),
            limits,
            state: Mutex::new(PoolState::default()),
            live,
            heartbeat: CancellationToken::new(),
        })
    }

    /// Start this pool's heartbeat task. It stops on [`ConnectionPool::shutdown`].
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        HeartbeatMonitor::new(self).spawn(self.heartbeat.clone())
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, count: usize) {
        self.live.send_replace(count);
        metrics::set_active_connections(&self.route, count);
    }

    /// Admit a connection and schedule its first probe.
    ///
    /// The returned slot releases the connection when dropped.
    pub fn admit(self: &Arc<Self>, handle: ConnectionHandle) -> Result<PoolSlot, AdmissionError> {
        let id = handle.id();
        let count = {
            let mut state = self.state();
            if state.closing {
                return Err(AdmissionError::Closed);
            }
            if state.queue.len() >= self.limits.max_connections {
                return Err(AdmissionError::Full {
                    max: self.limits.max_connections,
                });
            }
            state
                .queue
                .insert(handle, Instant::now() + self.limits.liveness_timeout);
            state.queue.len()
        };

        self.publish(count);
        tracing::debug!(route = %self.route, connection_id = %id, live = count, "Connection admitted");

        Ok(PoolSlot {
            pool: Arc::clone(self),
            id,
        })
    }

    /// Forget a connection. Safe to call more than once.
    pub fn release(&self, id: ConnectionId) -> bool {
        let (removed, count) = {
            let mut state = self.state();
            let removed = state.queue.remove(id).is_some();
            (removed, state.queue.len())
        };

        if removed {
            self.publish(count);
            tracing::debug!(route = %self.route, connection_id = %id, live = count, "Connection released");
        }
        removed
    }

    /// A pong arrived from `id`.
    pub fn record_pong(&self, id: ConnectionId) {
        self.state().queue.mark_responded(id);
    }

    /// Run one heartbeat cycle at `now`.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let (report, count, overdue) = {
            let mut state = self.state();
            let report = state.queue.sweep(
                now,
                self.limits.probes_per_cycle,
                self.limits.liveness_timeout,
            );
            let overdue = if tracing::enabled!(tracing::Level::DEBUG) {
                state.queue.overdue(now)
            } else {
                0
            };
            (report, state.queue.len(), overdue)
        };

        if report.terminated > 0 {
            self.publish(count);
        }
        metrics::record_heartbeat(&self.route, report.probed, report.terminated);
        tracing::debug!(
            route = %self.route,
            queue = count,
            probed = report.probed,
            terminated = report.terminated,
            deferred = report.deferred,
            overdue,
            "Heartbeat sweep"
        );

        report
    }

    pub fn live_connections(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_closing(&self) -> bool {
        self.state().closing
    }

    /// Stop admitting and ask every live connection to close.
    pub fn close_all(&self, signal: CloseSignal) {
        let handles: Vec<ConnectionHandle> = {
            let mut state = self.state();
            state.closing = true;
            state.queue.handles().cloned().collect()
        };

        tracing::info!(route = %self.route, connections = handles.len(), "Closing pooled connections");
        for handle in handles {
            handle.close(signal.clone());
        }
    }

    /// Resolves once no connection is live.
    pub async fn drained(&self) {
        let mut rx = self.live.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Stop the heartbeat task.
    pub fn shutdown(&self) {
        self.heartbeat.cancel();
    }
}

/// A RAII guard for one admitted connection.
#[derive(Debug)]
pub struct PoolSlot {
    pool: Arc<ConnectionPool>,
    id: ConnectionId,
}

impl PoolSlot {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}
