//! Reverse tunnel relay: expose a local HTTP service through a public server.

pub mod client;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod routing;
pub mod server;

pub use client::{Tunnel, TunnelEvent, TunnelOptions};
pub use config::{ClientConfig, ServerConfig};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
