//! Middleware applied to the control plane.

pub mod cors;

pub use cors::cors_middleware;
