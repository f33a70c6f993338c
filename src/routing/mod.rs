//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (Host header or URI authority)
//!     → host.rs (host → tunnel id)
//!     → Return: tunnel id, or none for the control plane
//! ```
//!
//! # Design Decisions
//! - Base domains compiled at startup, immutable at runtime
//! - No regex in hot path (label splitting only)
//! - Host matching is case-insensitive (RFC 9110)

pub mod host;

pub use host::SubdomainResolver;
