//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (capacities > 0, addresses parse)
//! - Check option combinations (key without cert)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: Config → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::{ClientConfig, ObservabilityConfig, ServerConfig};
use crate::server::ids;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn check_socket_addr(errors: &mut Vec<ValidationError>, field: &str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(field, format!("'{value}' is not a socket address")));
    }
}

fn check_observability(errors: &mut Vec<ValidationError>, config: &ObservabilityConfig) {
    if config.log_level.trim().is_empty() {
        errors.push(ValidationError::new("observability.log_level", "must not be empty"));
    }
    if config.metrics_enabled {
        check_socket_addr(errors, "observability.metrics_address", &config.metrics_address);
    }
}

pub fn validate_server_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_socket_addr(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if let Some(tls) = &config.listener.tls {
        if tls.cert_path.is_empty() {
            errors.push(ValidationError::new("listener.tls.cert_path", "must not be empty"));
        }
        if tls.key_path.is_empty() {
            errors.push(ValidationError::new("listener.tls.key_path", "must not be empty"));
        }
    }

    let tunnel = &config.tunnel;
    check_socket_addr(&mut errors, "tunnel.agent_bind_address", &tunnel.agent_bind_address);
    if tunnel.pool_capacity == 0 {
        errors.push(ValidationError::new("tunnel.pool_capacity", "must be greater than 0"));
    }
    if tunnel.max_sockets == 0 {
        errors.push(ValidationError::new("tunnel.max_sockets", "must be greater than 0"));
    }
    if url::Url::parse(&tunnel.landing).is_err() {
        errors.push(ValidationError::new("tunnel.landing", "must be an absolute URL"));
    }
    for domain in &tunnel.domains {
        if domain.trim_matches('.').is_empty() || domain.contains(':') || domain.contains('/') {
            errors.push(ValidationError::new("tunnel.domains", format!("'{domain}' is not a domain")));
        }
    }

    check_observability(&mut errors, &config.observability);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

pub fn validate_client_config(config: &ClientConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    match url::Url::parse(&config.host) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => {}
        _ => errors.push(ValidationError::new("host", "must be an http(s) URL")),
    }
    if config.port == 0 {
        errors.push(ValidationError::new("port", "local port is required"));
    }
    if let Some(subdomain) = &config.subdomain {
        if !ids::is_valid_subdomain(subdomain) {
            errors.push(ValidationError::new(
                "subdomain",
                "must be lowercase and between 4 and 63 alphanumeric characters",
            ));
        }
    }
    if config.local_cert.is_some() != config.local_key.is_some() {
        errors.push(ValidationError::new("local_cert", "local_cert and local_key go together"));
    }
    if config.local_retry_delay_ms == 0 {
        errors.push(ValidationError::new("local_retry_delay_ms", "must be greater than 0"));
    }

    check_observability(&mut errors, &config.observability);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
