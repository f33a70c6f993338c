//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum Router with the control plane handlers
//! - Dispatch tunnel hosts ahead of any route
//! - Wire up middleware (tracing, request ID, CORS)
//! - Bind the server to a plain or TLS listener
//! - Close every tunnel session on shutdown

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{middleware, routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::schema::{ServerConfig, TlsConfig};
use crate::http::control;
use crate::http::dispatch::tunnel_dispatch;
use crate::http::middleware::cors_middleware;
use crate::http::request::MakeRequestUuid;
use crate::net::tls::load_tls_config;
use crate::routing::SubdomainResolver;
use crate::server::manager::{ClientManager, ManagerOptions};

const TLS_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ClientManager>,
    pub resolver: Arc<SubdomainResolver>,
    pub config: Arc<ServerConfig>,
}

/// Public HTTP server of the relay.
pub struct HttpServer {
    router: Router,
    config: Arc<ServerConfig>,
    manager: Arc<ClientManager>,
}

impl HttpServer {
    pub fn new(config: ServerConfig) -> Self {
        let config = Arc::new(config);
        let manager = ClientManager::new(ManagerOptions::from(&config.tunnel));
        let resolver = Arc::new(SubdomainResolver::new(config.tunnel.domains.iter()));

        let state = AppState {
            manager: Arc::clone(&manager),
            resolver,
            config: Arc::clone(&config),
        };

        let router = Self::build_router(state);
        Self { router, config, manager }
    }

    /// Build the Axum router with all middleware layers.
    ///
    /// Tunnel dispatch wraps everything below it, so tunnel traffic never
    /// sees the control plane routes or their CORS headers.
    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/api/status", get(control::api_status))
            .route("/api/tunnels/{id}/status", get(control::tunnel_status))
            .route("/", get(control::root))
            .route("/{id}", get(control::claim))
            .layer(middleware::from_fn(cors_middleware))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(middleware::from_fn_with_state(state.clone(), tunnel_dispatch))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Run the server, accepting connections on the given listener.
    pub async fn run(self, listener: TcpListener, shutdown: broadcast::Receiver<()>) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let manager = Arc::clone(&self.manager);
        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                wait_for(shutdown).await;
                manager.shutdown();
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Run the server behind TLS on `addr`.
    pub async fn run_tls(
        self,
        addr: SocketAddr,
        tls: &TlsConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let rustls = load_tls_config(Path::new(&tls.cert_path), Path::new(&tls.key_path)).await?;
        tracing::info!(address = %addr, "HTTPS server starting");

        let handle = axum_server::Handle::new();
        let manager = Arc::clone(&self.manager);
        let drain = handle.clone();
        tokio::spawn(async move {
            wait_for(shutdown).await;
            manager.shutdown();
            drain.graceful_shutdown(Some(TLS_DRAIN_TIMEOUT));
        });

        axum_server::bind_rustls(addr, rustls)
            .handle(handle)
            .serve(self.router.into_make_service())
            .await?;

        tracing::info!("HTTPS server stopped");
        Ok(())
    }

    /// Router with all layers, for driving the server without a socket.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn manager(&self) -> &Arc<ClientManager> {
        &self.manager
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

async fn wait_for(mut shutdown: broadcast::Receiver<()>) {
    // A closed channel means the coordinator is gone; treat it as a trigger.
    let _ = shutdown.recv().await;
    tracing::info!("Shutdown signal received, closing tunnels");
}
