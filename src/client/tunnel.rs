//! Tunnel session setup against a relay server.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::client::cluster::{ClusterConfig, ClusterEvent, TunnelCluster, TunnelRequest};
use crate::client::TunnelError;
use crate::config::schema::ClientConfig;
use crate::net::tls::LocalTlsOptions;

const HANDSHAKE_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// Local port to expose.
    pub port: u16,
    /// Relay server base URL.
    pub host: String,
    pub subdomain: Option<String>,
    /// Local host to dial; also sent as the Host header when set.
    pub local_host: Option<String>,
    pub local_https: bool,
    pub local_tls: LocalTlsOptions,
    /// Extra headers for the setup request.
    pub headers: HashMap<String, String>,
    pub local_retry_delay: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            port: 0,
            host: "https://pipenet.dev".to_string(),
            subdomain: None,
            local_host: None,
            local_https: false,
            local_tls: LocalTlsOptions::default(),
            headers: HashMap::new(),
            local_retry_delay: Duration::from_secs(1),
        }
    }
}

impl From<&ClientConfig> for TunnelOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            port: config.port,
            host: config.host.clone(),
            subdomain: config.subdomain.clone(),
            local_host: config.local_host.clone(),
            local_https: config.local_https,
            local_tls: LocalTlsOptions {
                cert: config.local_cert.clone(),
                key: config.local_key.clone(),
                ca: config.local_ca.clone(),
                allow_invalid_cert: config.allow_invalid_cert,
            },
            headers: config.headers.clone(),
            local_retry_delay: Duration::from_millis(config.local_retry_delay_ms),
        }
    }
}

#[derive(Debug)]
pub enum TunnelEvent {
    /// The first leg is up and the public URL is reachable.
    Url(String),
    Request(TunnelRequest),
    Error(TunnelError),
    /// Closed and every leg has ended.
    Closed,
}

#[derive(Debug, Default, Deserialize)]
struct SessionResponse {
    id: Option<String>,
    ip: Option<String>,
    port: Option<u16>,
    url: Option<String>,
    cached_url: Option<String>,
    max_conn_count: Option<usize>,
    message: Option<String>,
}

/// Session details handed out by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub url: String,
    pub cached_url: Option<String>,
    pub remote_host: String,
    pub remote_port: u16,
    pub max_conn: usize,
}

/// An open tunnel.
pub struct Tunnel {
    info: SessionInfo,
    cluster: TunnelCluster,
}

impl Tunnel {
    /// Request a session from the relay and start its legs.
    pub async fn open(options: TunnelOptions) -> Result<(Self, mpsc::UnboundedReceiver<TunnelEvent>), TunnelError> {
        let info = request_session(&options).await?;
        tracing::info!(client_id = %info.id, url = %info.url, max_conn = info.max_conn, "Tunnel session assigned");

        let local_host = options.local_host.clone().unwrap_or_else(|| "localhost".to_string());
        let (cluster, cluster_events) = TunnelCluster::new(ClusterConfig {
            remote_host: info.remote_host.clone(),
            remote_port: info.remote_port,
            local_host,
            local_port: options.port,
            local_https: options.local_https,
            local_tls: options.local_tls.clone(),
            host_override: options.local_host.clone(),
            max_conn: info.max_conn,
            local_retry_delay: options.local_retry_delay,
        })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(relay_events(info.url.clone(), cluster_events, events_tx));
        cluster.start();

        Ok((Self { info, cluster }, events_rx))
    }

    pub fn client_id(&self) -> &str {
        &self.info.id
    }

    pub fn url(&self) -> &str {
        &self.info.url
    }

    pub fn cached_url(&self) -> Option<&str> {
        self.info.cached_url.as_deref()
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn live_legs(&self) -> usize {
        self.cluster.live_legs()
    }

    pub fn close(&self) {
        self.cluster.close();
    }
}

async fn relay_events(
    url: String,
    mut cluster: mpsc::UnboundedReceiver<ClusterEvent>,
    events: mpsc::UnboundedSender<TunnelEvent>,
) {
    let mut announced = false;
    while let Some(event) = cluster.recv().await {
        let event = match event {
            ClusterEvent::Open(_) if !announced => {
                announced = true;
                TunnelEvent::Url(url.clone())
            }
            ClusterEvent::Open(_) | ClusterEvent::Dead(_) => continue,
            ClusterEvent::Request(request) => TunnelEvent::Request(request),
            ClusterEvent::Error(err) => TunnelEvent::Error(err),
            ClusterEvent::Closed => {
                let _ = events.send(TunnelEvent::Closed);
                return;
            }
        };
        let _ = events.send(event);
    }
}

async fn request_session(options: &TunnelOptions) -> Result<SessionInfo, TunnelError> {
    let base = options.host.trim_end_matches('/');
    let uri = match &options.subdomain {
        Some(subdomain) => format!("{base}/{subdomain}"),
        None => format!("{base}/?new"),
    };
    let remote_host = url::Url::parse(&options.host)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .ok_or_else(|| TunnelError::InvalidHost(options.host.clone()))?;

    let headers = header_map(&options.headers)?;
    let http = reqwest::Client::builder().build()?;

    loop {
        let response = match http.get(&uri).headers(headers.clone()).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, uri = %uri, "Tunnel server offline, retrying");
                tokio::time::sleep(HANDSHAKE_RETRY).await;
                continue;
            }
        };

        let status = response.status();
        let body: SessionResponse = match response.json().await {
            Ok(body) => body,
            Err(e) if status.is_success() => return Err(TunnelError::InvalidResponse(e.to_string())),
            Err(_) => SessionResponse::default(),
        };

        if !status.is_success() {
            let message = body
                .message
                .unwrap_or_else(|| "tunnel server returned an error, please try again".to_string());
            return Err(TunnelError::Server(message));
        }

        return session_info(body, remote_host);
    }
}

fn session_info(body: SessionResponse, remote_host: String) -> Result<SessionInfo, TunnelError> {
    let id = body
        .id
        .ok_or_else(|| TunnelError::InvalidResponse("missing id".to_string()))?;
    let remote_port = body
        .port
        .ok_or_else(|| TunnelError::InvalidResponse("missing port".to_string()))?;
    let url = body
        .url
        .ok_or_else(|| TunnelError::InvalidResponse("missing url".to_string()))?;

    Ok(SessionInfo {
        id,
        url,
        cached_url: body.cached_url,
        remote_host: body.ip.unwrap_or(remote_host),
        remote_port,
        max_conn: body.max_conn_count.unwrap_or(1).max(1),
    })
}

fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap, TunnelError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| TunnelError::InvalidHeader(name.clone()))?;
        let value = HeaderValue::from_str(value).map_err(|_| TunnelError::InvalidHeader(name.to_string()))?;
        map.insert(name, value);
    }
    Ok(map)
}
