//! Control plane: session creation and status.
//!
//! | Route                       | Response                               |
//! |-----------------------------|----------------------------------------|
//! | `GET /api/status`           | `{ "tunnels": n }`                     |
//! | `GET /api/tunnels/{id}/status` | `{ "connected_sockets": n }` or 404 |
//! | `GET /?new`                 | new session with a random id           |
//! | `GET /`                     | 302 to the landing page                |
//! | `GET /{id}`                 | new session with the requested id      |

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::http::server::AppState;
use crate::server::ids;
use crate::server::manager::{ManagerStats, NewClientInfo};

const INVALID_SUBDOMAIN: &str =
    "Invalid subdomain. Subdomains must be lowercase and between 4 and 63 alphanumeric characters.";

/// JSON error body `{ "message": ... }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { message: &self.message })).into_response()
    }
}

/// Session description handed to tunnel clients.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    #[serde(flatten)]
    pub info: NewClientInfo,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

pub async fn api_status(State(state): State<AppState>) -> Json<ManagerStats> {
    Json(state.manager.stats())
}

pub async fn tunnel_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.manager.get_client(&id) {
        Some(client) => Json(client.stats()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn root(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !params.contains_key("new") {
        let landing = state.config.tunnel.landing.as_str();
        return (StatusCode::FOUND, [(header::LOCATION, landing)]).into_response();
    }
    create_session(&state, None, &headers).await.into_response()
}

pub async fn claim(State(state): State<AppState>, Path(id): Path<String>, headers: HeaderMap) -> Response {
    if !ids::is_valid_subdomain(&id) {
        return ApiError::new(StatusCode::FORBIDDEN, INVALID_SUBDOMAIN).into_response();
    }
    create_session(&state, Some(&id), &headers).await.into_response()
}

async fn create_session(
    state: &AppState,
    requested_id: Option<&str>,
    headers: &HeaderMap,
) -> Result<Json<SessionResponse>, ApiError> {
    let info = state.manager.new_client(requested_id).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to create tunnel session");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create tunnel")
    })?;

    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    let scheme = if state.config.tunnel.secure { "https" } else { "http" };
    let url = format!("{scheme}://{}.{host}", info.id);

    Ok(Json(SessionResponse {
        info,
        url,
        ip: state.config.tunnel.public_ip.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_response_shape() {
        let body = SessionResponse {
            info: NewClientInfo {
                id: "demo-app".to_string(),
                port: 4000,
                max_conn_count: Some(10),
            },
            url: "http://demo-app.example.com".to_string(),
            ip: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": "demo-app",
                "port": 4000,
                "max_conn_count": 10,
                "url": "http://demo-app.example.com",
            })
        );
    }

    #[tokio::test]
    async fn api_error_body() {
        let res = ApiError::new(StatusCode::FORBIDDEN, INVALID_SUBDOMAIN).into_response();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["message"], INVALID_SUBDOMAIN);
    }
}
