//! Metrics collection and exposition.
//!
//! # Metrics
//! - `ws_upgrades_total` (counter): upgrade attempts by route, outcome
//! - `ws_connections_active` (gauge): live connections per route
//! - `ws_heartbeat_probes_total` (counter): pings sent per route
//! - `ws_heartbeat_terminations_total` (counter): silent peers dropped per route
//! - `ws_subscriptions_active` (gauge): running `graphql-ws` subscriptions
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so library users
//!   and tests pay nothing
//! - The Prometheus exporter serves its own HTTP listener

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

pub const WS_UPGRADES_TOTAL: &str = "ws_upgrades_total";
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
pub const WS_HEARTBEAT_PROBES_TOTAL: &str = "ws_heartbeat_probes_total";
pub const WS_HEARTBEAT_TERMINATIONS_TOTAL: &str = "ws_heartbeat_terminations_total";
pub const WS_SUBSCRIPTIONS_ACTIVE: &str = "ws_subscriptions_active";

/// Install the global Prometheus recorder with a scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Prometheus exporter listening");
    Ok(())
}

/// Outcome label for `ws_upgrades_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeOutcome {
    Accepted,
    MalformedUrl,
    ShuttingDown,
    RouteNotFound,
    Rejected,
    UnsupportedProtocol,
    PoolFull,
}

impl UpgradeOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::MalformedUrl => "malformed_url",
            Self::ShuttingDown => "shutting_down",
            Self::RouteNotFound => "route_not_found",
            Self::Rejected => "rejected",
            Self::UnsupportedProtocol => "unsupported_protocol",
            Self::PoolFull => "pool_full",
        }
    }
}

pub fn record_upgrade(route: &str, outcome: UpgradeOutcome) {
    counter!(WS_UPGRADES_TOTAL, "route" => route.to_string(), "outcome" => outcome.as_str())
        .increment(1);
}

pub fn set_active_connections(route: &str, count: usize) {
    gauge!(WS_CONNECTIONS_ACTIVE, "route" => route.to_string()).set(count as f64);
}

pub fn record_heartbeat(route: &str, probed: usize, terminated: usize) {
    if probed > 0 {
        counter!(WS_HEARTBEAT_PROBES_TOTAL, "route" => route.to_string()).increment(probed as u64);
    }
    if terminated > 0 {
        counter!(WS_HEARTBEAT_TERMINATIONS_TOTAL, "route" => route.to_string())
            .increment(terminated as u64);
    }
}

pub fn subscription_opened() {
    gauge!(WS_SUBSCRIPTIONS_ACTIVE).increment(1.0);
}

pub fn subscription_closed() {
    gauge!(WS_SUBSCRIPTIONS_ACTIVE).decrement(1.0);
}
