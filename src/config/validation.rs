//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (sizes > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GateConfig → Result<(), Vec<ValidationError>>

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::GateConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

pub fn validate_config(config: &GateConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let client = &config.client;
    if client.pool_size == 0 {
        errors.push(ValidationError::new("client.pool_size", "must be at least 1"));
    }
    if client.pool_max_streams == 0 {
        errors.push(ValidationError::new("client.pool_max_streams", "must be at least 1"));
    }
    if client.pool_ttl_secs == 0 {
        errors.push(ValidationError::new("client.pool_ttl_secs", "must be positive"));
    }
    if client.max_recv_msg_size == 0 || client.max_send_msg_size == 0 {
        errors.push(ValidationError::new("client.max_*_msg_size", "must be positive"));
    }
    for (name, addr) in &client.services {
        if addr.trim().is_empty() {
            errors.push(ValidationError::new("client.services", format!("empty address for {name}")));
        }
    }

    check_addr(&mut errors, "server.bind_address", &config.server.bind_address);
    if config.server.max_recv_msg_size == 0 || config.server.max_send_msg_size == 0 {
        errors.push(ValidationError::new("server.max_*_msg_size", "must be positive"));
    }

    let gateway = &config.gateway;
    check_addr(&mut errors, "gateway.bind_address", &gateway.bind_address);
    if !gateway.prefix.starts_with('/') || gateway.prefix.ends_with('/') {
        errors.push(ValidationError::new(
            "gateway.prefix",
            format!("{:?} must start with '/' and not end with one", gateway.prefix),
        ));
    }
    if gateway.max_body_size == 0 {
        errors.push(ValidationError::new("gateway.max_body_size", "must be positive"));
    }
    if gateway.ws_ping_period_secs == 0 {
        errors.push(ValidationError::new("gateway.ws_ping_period_secs", "must be positive"));
    }
    if let Some(auth) = &gateway.auth {
        if auth.header.is_empty() {
            errors.push(ValidationError::new("gateway.auth.header", "must not be empty"));
        }
        if auth.tokens.is_empty() {
            errors.push(ValidationError::new("gateway.auth.tokens", "at least one token is required"));
        }
    }

    if config.observability.metrics_enabled {
        check_addr(&mut errors, "observability.metrics_address", &config.observability.metrics_address);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_addr(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(field, format!("{value:?} is not a socket address")));
    }
}
