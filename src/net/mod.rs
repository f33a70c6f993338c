//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Relay side:
//!     agent listener → socket.rs (idle close detection) → pooled connection
//!
//! Tunnel client side:
//!     remote relay dial → socket.rs (keep-alive)
//!     local service dial → tls.rs (optional) → stream.rs (plain or TLS)
//! ```
//!
//! # Design Decisions
//! - TLS is optional and handled transparently behind `LocalStream`
//! - Only the public listener TLS goes through axum-server

pub mod socket;
pub mod stream;
pub mod tls;

pub use stream::LocalStream;
