//! One tunnel session: proxies public requests into the connection pool.
//!
//! # Responsibilities
//! - Forward plain HTTP requests over pooled connections (hyper-util client)
//! - Replay upgrade requests over a claimed connection and bridge both sides
//! - Close itself when the tunnel client stays offline past a grace period

use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use axum::body::Body;
use axum::http::uri::{Authority, Scheme};
use axum::http::{Request, StatusCode, Uri, Version};
use axum::response::{IntoResponse, Response};
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use crate::observability::metrics;
use crate::server::agent::{AgentConnector, AgentEvent, AgentStats, TunnelAgent};

/// Idle pooled HTTP connections kept per session.
const MAX_IDLE_PER_TUNNEL: usize = 1;

type TunnelHttpClient = HyperClient<AgentConnector, Body>;

/// A registered tunnel session.
pub struct Client {
    id: String,
    agent: TunnelAgent,
    http: Mutex<Option<TunnelHttpClient>>,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Client {
    /// Create a session around `agent`.
    ///
    /// With an `offline_grace`, the session closes when no connection is live
    /// for that long, counting from creation and from every `Offline`.
    pub fn new(id: impl Into<String>, agent: TunnelAgent, offline_grace: Option<Duration>) -> Arc<Self> {
        let http = HyperClient::builder(TokioExecutor::new())
            .pool_max_idle_per_host(MAX_IDLE_PER_TUNNEL)
            .build(AgentConnector::new(agent.clone()));
        let (closed, _) = watch::channel(false);

        let events = agent.subscribe();
        let client = Arc::new(Self {
            id: id.into(),
            agent,
            http: Mutex::new(Some(http)),
            closed,
        });

        tokio::spawn(supervise(Arc::downgrade(&client), events, client.closed.subscribe(), offline_grace));
        client
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent(&self) -> &TunnelAgent {
        &self.agent
    }

    pub fn stats(&self) -> AgentStats {
        self.agent.stats()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Tear the session down. Idempotent.
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.agent.destroy();
        let http = self.http.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        drop(http);
        tracing::debug!(client_id = %self.id, "Tunnel session closed");
    }

    fn http_client(&self) -> Option<TunnelHttpClient> {
        self.http
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Proxy one request through the tunnel, relaying the response as is.
    pub async fn handle_request(&self, req: Request<Body>) -> Response {
        let Some(http) = self.http_client() else {
            return (StatusCode::BAD_GATEWAY, "Tunnel closed").into_response();
        };

        metrics::record_request("http");
        let (mut parts, body) = req.into_parts();
        parts.uri = self.tunnel_uri(&parts.uri);
        parts.version = Version::HTTP_11;

        match http.request(Request::from_parts(parts, body)).await {
            Ok(res) => {
                let (parts, body) = res.into_parts();
                Response::from_parts(parts, Body::new(body))
            }
            Err(e) => {
                tracing::warn!(client_id = %self.id, error = %e, "Tunnel request failed");
                metrics::record_upstream_error();
                (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response()
            }
        }
    }

    /// Replay an upgrade request over a pooled connection.
    ///
    /// On `101 Switching Protocols` both upgraded connections are bridged
    /// until either side closes.
    pub async fn handle_upgrade(&self, mut req: Request<Body>) -> Response {
        metrics::record_request("upgrade");
        let inbound = hyper::upgrade::on(&mut req);

        let stream = match self.agent.claim().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(client_id = %self.id, error = %e, "No tunnel connection for upgrade");
                metrics::record_upstream_error();
                return (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response();
            }
        };

        let (mut sender, conn) = match hyper::client::conn::http1::handshake::<_, Body>(stream).await {
            Ok(handshake) => handshake,
            Err(e) => {
                tracing::warn!(client_id = %self.id, error = %e, "Tunnel handshake failed");
                metrics::record_upstream_error();
                return (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response();
            }
        };
        let client_id = self.id.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                tracing::debug!(client_id = %client_id, error = %e, "Tunnel upgrade connection ended");
            }
        });

        *req.version_mut() = Version::HTTP_11;
        let mut res = match sender.send_request(req).await {
            Ok(res) => res,
            Err(e) => {
                tracing::warn!(client_id = %self.id, error = %e, "Tunnel upgrade request failed");
                metrics::record_upstream_error();
                return (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response();
            }
        };

        if res.status() == StatusCode::SWITCHING_PROTOCOLS {
            let outbound = hyper::upgrade::on(&mut res);
            let client_id = self.id.clone();
            tokio::spawn(async move {
                match tokio::try_join!(inbound, outbound) {
                    Ok((inbound, outbound)) => {
                        let mut inbound = TokioIo::new(inbound);
                        let mut outbound = TokioIo::new(outbound);
                        match tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
                            Ok((up, down)) => {
                                tracing::trace!(client_id = %client_id, up, down, "Upgraded connection finished")
                            }
                            Err(e) => {
                                tracing::debug!(client_id = %client_id, error = %e, "Upgraded connection ended")
                            }
                        }
                    }
                    Err(e) => tracing::debug!(client_id = %client_id, error = %e, "Upgrade failed"),
                }
            });
        }

        let (parts, body) = res.into_parts();
        Response::from_parts(parts, Body::new(body))
    }

    /// Absolute URI for the pooled client. Only the path is sent on the wire.
    fn tunnel_uri(&self, uri: &Uri) -> Uri {
        let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let authority = Authority::from_str(&self.id).unwrap_or_else(|_| Authority::from_static("tunnel.invalid"));
        Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(authority)
            .path_and_query(path_and_query)
            .build()
            .unwrap_or_else(|_| uri.clone())
    }
}

/// Follows the agent's events, closing the session on shutdown or when the
/// grace period runs out.
async fn supervise(
    client: Weak<Client>,
    mut events: broadcast::Receiver<AgentEvent>,
    mut closed: watch::Receiver<bool>,
    grace: Option<Duration>,
) {
    let mut deadline = grace.map(|grace| Instant::now() + grace);

    loop {
        let countdown = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            event = events.recv() => match event {
                Ok(AgentEvent::Online) => deadline = None,
                Ok(AgentEvent::Offline) => deadline = grace.map(|grace| Instant::now() + grace),
                Ok(AgentEvent::Closed) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(_)) => {
                    let Some(client) = client.upgrade() else { return };
                    if client.stats().connected_sockets > 0 {
                        deadline = None;
                    } else if deadline.is_none() {
                        deadline = grace.map(|grace| Instant::now() + grace);
                    }
                }
            },
            _ = countdown => {
                if let Some(client) = client.upgrade() {
                    tracing::info!(client_id = %client.id, "Tunnel client did not connect in time");
                }
                break;
            }
            _ = closed.wait_for(|closed| *closed) => break,
        }
    }

    if let Some(client) = client.upgrade() {
        client.close();
    }
}
