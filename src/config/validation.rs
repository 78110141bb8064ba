//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, addresses parse)
//! - Check that the heartbeat budget fits the admission cap
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::GatewayConfig;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }

    let limits = &config.limits;
    if limits.max_connections == 0 {
        errors.push(ValidationError::new("limits.max_connections", "must be greater than 0"));
    }
    if limits.probes_per_cycle == 0 {
        errors.push(ValidationError::new("limits.probes_per_cycle", "must be greater than 0"));
    }
    if limits.probes_per_cycle > limits.max_connections {
        errors.push(ValidationError::new(
            "limits.probes_per_cycle",
            "must not exceed limits.max_connections",
        ));
    }
    if limits.liveness_timeout_ms == 0 {
        errors.push(ValidationError::new("limits.liveness_timeout_ms", "must be greater than 0"));
    }

    if config.shutdown.drain_timeout_secs == 0 {
        errors.push(ValidationError::new("shutdown.drain_timeout_secs", "must be greater than 0"));
    }

    let observability = &config.observability;
    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
