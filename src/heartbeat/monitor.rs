//! Periodic heartbeat sweeps.
//!
//! # Responsibilities
//! - Tick once per sweep interval for one pool
//! - Run the pool's bounded sweep on every tick

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::pool::ConnectionPool;

pub struct HeartbeatMonitor {
    pool: Weak<ConnectionPool>,
    route: String,
    interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(pool: &Arc<ConnectionPool>) -> Self {
        Self {
            pool: Arc::downgrade(pool),
            route: pool.route().to_string(),
            interval: pool.limits().sweep_interval(),
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            route = %self.route,
            interval_ms = self.interval.as_millis() as u64,
            "Heartbeat monitor starting"
        );

        // Ticks that fall behind are delayed, never replayed in a burst.
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(pool) = self.pool.upgrade() else {
                        break;
                    };
                    pool.sweep(Instant::now());
                }
                _ = shutdown.cancelled() => {
                    tracing::info!(route = %self.route, "Heartbeat monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
