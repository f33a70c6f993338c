//! Tunnel client: exposes a local service through a relay.
//!
//! # Data Flow
//! ```text
//! tunnel.rs   GET {host}/{subdomain | ?new} → session info
//! cluster.rs  max_conn legs: relay port ⇄ local service
//!             host_rewrite.rs on the relay → local direction
//! ```

use std::io;

use crate::net::tls::TlsError;

pub mod cluster;
pub mod host_rewrite;
pub mod tunnel;

pub use cluster::{ClusterConfig, ClusterEvent, LegId, TunnelCluster, TunnelRequest};
pub use host_rewrite::HostRewriter;
pub use tunnel::{Tunnel, TunnelEvent, TunnelOptions};

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("connection refused: {addr} (check your firewall settings)")]
    RemoteRefused { addr: String },
    #[error("local connection to {addr} failed: {source}")]
    Local {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    Server(String),
    #[error("invalid tunnel server response: {0}")]
    InvalidResponse(String),
    #[error("invalid tunnel host: {0}")]
    InvalidHost(String),
    #[error("invalid request header {0}")]
    InvalidHeader(String),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}
