//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderMap, Uri};
use axum::Router;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use tunnel_relay::server::ClientManager;
use tunnel_relay::{HttpServer, ServerConfig};

pub const DOMAIN: &str = "example.com";

/// A relay server on an ephemeral port.
pub struct TestRelay {
    pub addr: SocketAddr,
    pub manager: Arc<ClientManager>,
    shutdown: broadcast::Sender<()>,
}

impl TestRelay {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }
}

pub async fn start_relay() -> TestRelay {
    let mut config = ServerConfig::default();
    config.tunnel.domains = vec![DOMAIN.to_string()];
    config.tunnel.agent_bind_address = "127.0.0.1:0".to_string();

    let server = HttpServer::new(config);
    let manager = Arc::clone(server.manager());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, rx) = broadcast::channel(1);
    tokio::spawn(server.run(listener, rx));

    TestRelay { addr, manager, shutdown }
}

/// HTTP client that leaves redirects to the caller.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// A local service answering `host=<Host header> path=<path and query>`.
pub async fn start_echo_service() -> SocketAddr {
    let app = Router::new().fallback(|headers: HeaderMap, uri: Uri| async move {
        let host = headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let path = uri.path_and_query().map(|pq| pq.as_str().to_string()).unwrap_or_default();
        format!("host={host} path={path}")
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Open one tunnel connection to `tunnel_port` and pipe it to `local`,
/// as a tunnel client leg would.
pub async fn open_leg(tunnel_port: u16, local: SocketAddr) {
    let mut remote = TcpStream::connect(("127.0.0.1", tunnel_port)).await.unwrap();
    tokio::spawn(async move {
        let Ok(mut local) = TcpStream::connect(local).await else {
            return;
        };
        let _ = copy_bidirectional(&mut remote, &mut local).await;
    });
}

/// Create a session with the requested id and return its tunnel port.
pub async fn create_session(relay: &TestRelay, id: &str) -> u16 {
    let body: serde_json::Value = http_client()
        .get(relay.url(&format!("/{id}")))
        .header(header::HOST.as_str(), DOMAIN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["id"], id);
    body["port"].as_u64().unwrap() as u16
}

/// Poll until the session reports `expected` connected sockets.
pub async fn wait_for_sockets(relay: &TestRelay, id: &str, expected: usize) {
    for _ in 0..100 {
        if let Some(client) = relay.manager.get_client(id) {
            if client.stats().connected_sockets == expected {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{id} never reached {expected} connected sockets");
}
