//! Host based dispatch between tunnels and the control plane.
//!
//! ```text
//! request ─▶ Host? ──none──▶ 400
//!              │
//!              ├─ no client id ──────────▶ control plane (next)
//!              ├─ unknown client ────────▶ 404
//!              ├─ upgrade ───────────────▶ Client::handle_upgrade
//!              └─ otherwise ─────────────▶ Client::handle_request
//! ```

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::http::request::{is_upgrade_request, request_host};
use crate::http::server::AppState;

pub async fn tunnel_dispatch(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let Some(host) = request_host(&req) else {
        return (StatusCode::BAD_REQUEST, "Host header is required").into_response();
    };

    let Some(client_id) = state.resolver.client_id(&host) else {
        return next.run(req).await;
    };

    let upgrade = is_upgrade_request(&req);
    let Some(client) = state.manager.get_client(&client_id) else {
        tracing::debug!(client_id = %client_id, host = %host, "Request for unknown tunnel");
        if upgrade {
            // The raw socket is not ours to reset; hang up after the 404 instead.
            return (StatusCode::NOT_FOUND, [(header::CONNECTION, "close")]).into_response();
        }
        return StatusCode::NOT_FOUND.into_response();
    };

    if upgrade {
        client.handle_upgrade(req).await
    } else {
        client.handle_request(req).await
    }
}
