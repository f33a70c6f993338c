//! Structured logging.
//!
//! # Responsibilities
//! - Initialize logging subsystem
//! - Configure log level from config, `RUST_LOG` taking precedence
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - JSON format for production, pretty format for development

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::schema::{LogFormat, ObservabilityConfig};

/// Filter used when `RUST_LOG` is not set.
pub fn default_filter(config: &ObservabilityConfig) -> EnvFilter {
    let level = config.log_level.trim();
    // A bare level applies to this crate and the HTTP layers only.
    let directive = if level.contains('=') || level.contains(',') {
        level.to_string()
    } else {
        format!("tunnel_relay={level},tower_http={level},warn")
    };
    EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("tunnel_relay=info,warn"))
}

/// Install the global subscriber. Later calls are ignored.
pub fn init_logging(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(config));
    let json = config.log_format == LogFormat::Json;

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .try_init();

    if result.is_err() {
        tracing::debug!("Logging already initialized");
    }
}
