//! Configuration schema definitions.
//!
//! This module defines the configuration of both binaries: the relay server
//! and the tunnel client. All types derive Serde traits for deserialization
//! from config files, and every field has a default.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for the relay server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Public listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// Tunnel session settings.
    pub tunnel: TunnelConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:3000").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            tls: None,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Tunnel session configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Base domains tunnels are served under (e.g. "example.com").
    pub domains: Vec<String>,

    /// Where `GET /` without `?new` redirects.
    pub landing: String,

    /// Advertise `https://` tunnel URLs.
    pub secure: bool,

    /// Connection count advertised to tunnel clients.
    pub max_sockets: usize,

    /// Live connections accepted per tunnel.
    pub pool_capacity: usize,

    /// Listener address for tunnel pools; port 0 picks a free port.
    pub agent_bind_address: String,

    /// Time a tunnel may stay without connections before removal (0 = never).
    pub offline_grace_ms: u64,

    /// Address tunnel clients should dial instead of the request host.
    pub public_ip: Option<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            landing: "https://pipenet.dev/".to_string(),
            secure: false,
            max_sockets: 10,
            pool_capacity: 10,
            agent_bind_address: "0.0.0.0:0".to_string(),
            offline_grace_ms: 1000,
            public_ip: None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, for development.
    #[default]
    Pretty,
    /// One JSON object per line, for log aggregation.
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive.
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Root configuration for the tunnel client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay server base URL.
    pub host: String,

    /// Local port to expose.
    pub port: u16,

    /// Requested tunnel id.
    pub subdomain: Option<String>,

    /// Local host to dial; also replaces the Host header when set.
    pub local_host: Option<String>,

    /// The local service speaks HTTPS.
    pub local_https: bool,

    /// Client certificate for the local service (PEM).
    pub local_cert: Option<PathBuf>,

    /// Key for `local_cert` (PEM).
    pub local_key: Option<PathBuf>,

    /// CA used to verify the local service (PEM).
    pub local_ca: Option<PathBuf>,

    /// Skip certificate verification of the local service.
    pub allow_invalid_cert: bool,

    /// Extra headers for the session request.
    pub headers: HashMap<String, String>,

    /// Print each request passing through the tunnel.
    pub print_requests: bool,

    /// Delay between local dial attempts.
    pub local_retry_delay_ms: u64,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "https://pipenet.dev".to_string(),
            port: 0,
            subdomain: None,
            local_host: None,
            local_https: false,
            local_cert: None,
            local_key: None,
            local_ca: None,
            allow_invalid_cert: false,
            headers: HashMap::new(),
            print_requests: false,
            local_retry_delay_ms: 1000,
            observability: ObservabilityConfig::default(),
        }
    }
}
