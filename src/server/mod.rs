//! Relay side of the tunnel.
//!
//! # Data Flow
//! ```text
//! GET /?new or /{id}
//!     → manager.rs (allocate id, start a pool, register)
//!     → agent.rs (listener for the tunnel client's legs)
//!
//! Public request for {id}.{domain}
//!     → manager.rs (lookup)
//!     → client.rs (hyper client or upgrade bridge)
//!     → agent.rs (claim a pooled connection)
//! ```

pub mod agent;
pub mod client;
pub mod ids;
pub mod manager;

pub use agent::{AgentError, AgentEvent, AgentStats, TunnelAgent, TunnelStream};
pub use client::Client;
pub use manager::{ClientManager, ManagerError, ManagerOptions, NewClientInfo};
