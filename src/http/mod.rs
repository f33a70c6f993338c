//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, middleware)
//!     → dispatch.rs (Host → tunnel id)
//!         → tunnel: server::Client (request or upgrade replay)
//!         → control plane: request ID, CORS, control.rs handlers
//! ```

pub mod control;
pub mod dispatch;
pub mod middleware;
pub mod request;
pub mod server;

pub use request::X_REQUEST_ID;
pub use server::{AppState, HttpServer};
