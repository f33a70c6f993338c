//! Legs between the relay and the local service.
//!
//! # Responsibilities
//! - Open `max_conn` legs, each a relay connection bridged to a local one
//! - Retry the local dial while the service is down
//! - Replace every leg that dies until the cluster is closed
//! - Surface requests and errors as events
//!
//! # Data Flow
//! ```text
//! connect relay ──▶ Open ──▶ dial local (retry on refused/reset)
//!                               │
//!                               ▼
//!        relay ──[HostRewriter]──▶ local
//!        relay ◀───────────────── local
//!                               │
//!                               ▼
//!                             Dead ──▶ replacement leg (unless closed)
//! ```
//!
//! # Design Decisions
//! - The relay is not read while the local dial is in progress
//! - A leg ending on a fatal error is not replaced

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsConnector;

use crate::client::host_rewrite::HostRewriter;
use crate::client::TunnelError;
use crate::net::socket;
use crate::net::tls::{self, LocalTlsOptions};
use crate::net::LocalStream;

const READ_BUFFER: usize = 16 * 1024;

static LEG_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LegId(u64);

impl LegId {
    fn next() -> Self {
        Self(LEG_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for LegId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "leg-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub remote_host: String,
    pub remote_port: u16,
    pub local_host: String,
    pub local_port: u16,
    pub local_https: bool,
    pub local_tls: LocalTlsOptions,
    /// Host header value sent to the local service.
    pub host_override: Option<String>,
    pub max_conn: usize,
    pub local_retry_delay: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            remote_host: "localhost".to_string(),
            remote_port: 0,
            local_host: "localhost".to_string(),
            local_port: 0,
            local_https: false,
            local_tls: LocalTlsOptions::default(),
            host_override: None,
            max_conn: 1,
            local_retry_delay: Duration::from_secs(1),
        }
    }
}

impl ClusterConfig {
    fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

/// Start of an HTTP request seen on a leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub method: String,
    pub path: String,
}

#[derive(Debug)]
pub enum ClusterEvent {
    /// A leg connected to the relay.
    Open(LegId),
    /// A leg ended and is replaced unless the cluster is closed.
    Dead(LegId),
    Request(TunnelRequest),
    Error(TunnelError),
    /// The cluster is closed and every leg has ended.
    Closed,
}

enum LegEvent {
    Open(LegId),
    /// Ended, replace it.
    Dead(LegId),
    /// Ended without replacement.
    Ended(LegId),
    Request(TunnelRequest),
    Error(TunnelError),
}

struct ClusterInner {
    config: ClusterConfig,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    shutdown: watch::Sender<bool>,
    legs: mpsc::UnboundedSender<LegEvent>,
    running: AtomicUsize,
    live: AtomicUsize,
}

impl ClusterInner {
    fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn emit(&self, event: LegEvent) {
        let _ = self.legs.send(event);
    }
}

/// The set of legs of one tunnel.
pub struct TunnelCluster {
    inner: Arc<ClusterInner>,
}

impl TunnelCluster {
    /// Build a cluster and the channel its events are delivered on.
    ///
    /// No leg is opened until [`TunnelCluster::start`] or
    /// [`TunnelCluster::open`].
    pub fn new(config: ClusterConfig) -> Result<(Self, mpsc::UnboundedReceiver<ClusterEvent>), TunnelError> {
        let tls = if config.local_https {
            let connector = tls::local_connector(&config.local_tls)?;
            Some((connector, tls::server_name(&config.local_host)?))
        } else {
            None
        };

        let (shutdown, _) = watch::channel(false);
        let (legs_tx, legs_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ClusterInner {
            config,
            tls,
            shutdown,
            legs: legs_tx,
            running: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
        });
        tokio::spawn(supervise(Arc::clone(&inner), legs_rx, events_tx));

        Ok((Self { inner }, events_rx))
    }

    /// Open `max_conn` legs.
    pub fn start(&self) {
        for _ in 0..self.inner.config.max_conn.max(1) {
            self.open();
        }
    }

    /// Open exactly one leg.
    pub fn open(&self) -> LegId {
        spawn_leg(&self.inner)
    }

    /// Stop replacing legs and wind the open ones down.
    pub fn close(&self) {
        if !self.inner.shutdown.send_replace(true) {
            tracing::debug!("Closing tunnel cluster");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Legs currently connected to the relay.
    pub fn live_legs(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }
}

impl Drop for TunnelCluster {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_leg(inner: &Arc<ClusterInner>) -> LegId {
    let id = LegId::next();
    if inner.is_closed() {
        return id;
    }
    inner.running.fetch_add(1, Ordering::SeqCst);
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let event = match run_leg(id, &inner).await {
            LegEnd::Dead => LegEvent::Dead(id),
            LegEnd::Ended => LegEvent::Ended(id),
        };
        inner.emit(event);
    });
    id
}

async fn supervise(
    inner: Arc<ClusterInner>,
    mut legs: mpsc::UnboundedReceiver<LegEvent>,
    events: mpsc::UnboundedSender<ClusterEvent>,
) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut open = HashSet::new();
    let mut closing = false;

    loop {
        if closing && inner.running.load(Ordering::SeqCst) == 0 {
            break;
        }

        let event = tokio::select! {
            event = legs.recv() => event,
            _ = shutdown.wait_for(|closed| *closed), if !closing => {
                closing = true;
                continue;
            }
        };
        let Some(event) = event else { break };

        let forward = match event {
            LegEvent::Open(id) => {
                open.insert(id);
                inner.live.store(open.len(), Ordering::SeqCst);
                tracing::debug!(leg = %id, live = open.len(), "Tunnel leg open");
                ClusterEvent::Open(id)
            }
            LegEvent::Dead(id) => {
                finish_leg(&inner, &mut open, id);
                tracing::debug!(leg = %id, live = open.len(), "Tunnel leg dead");
                if !inner.is_closed() {
                    spawn_leg(&inner);
                }
                ClusterEvent::Dead(id)
            }
            LegEvent::Ended(id) => {
                finish_leg(&inner, &mut open, id);
                continue;
            }
            LegEvent::Request(request) => ClusterEvent::Request(request),
            LegEvent::Error(err) => ClusterEvent::Error(err),
        };
        let _ = events.send(forward);
    }

    tracing::debug!("Tunnel cluster closed");
    let _ = events.send(ClusterEvent::Closed);
}

fn finish_leg(inner: &ClusterInner, open: &mut HashSet<LegId>, id: LegId) {
    open.remove(&id);
    inner.live.store(open.len(), Ordering::SeqCst);
    inner.running.fetch_sub(1, Ordering::SeqCst);
}

enum LegEnd {
    Dead,
    Ended,
}

enum LocalDial {
    Connected(LocalStream),
    RemoteClosed,
    Shutdown,
    Failed(TunnelError),
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

async fn run_leg(id: LegId, inner: &ClusterInner) -> LegEnd {
    let config = &inner.config;
    let mut shutdown = inner.shutdown.subscribe();
    let remote_addr = config.remote_addr();

    tracing::debug!(
        leg = %id,
        remote = %remote_addr,
        local = %config.local_addr(),
        https = config.local_https,
        "Establishing tunnel leg"
    );

    let remote = tokio::select! {
        remote = TcpStream::connect(&remote_addr) => remote,
        _ = wait_for_shutdown(&mut shutdown) => return LegEnd::Ended,
    };
    let remote = match remote {
        Ok(remote) => remote,
        Err(e) => {
            tracing::debug!(leg = %id, error = %e, "Relay connection failed");
            if e.kind() == io::ErrorKind::ConnectionRefused {
                inner.emit(LegEvent::Error(TunnelError::RemoteRefused { addr: remote_addr }));
            }
            return LegEnd::Ended;
        }
    };
    if let Err(e) = socket::enable_keepalive(&remote) {
        tracing::debug!(leg = %id, error = %e, "Failed to enable keep-alive");
    }
    inner.emit(LegEvent::Open(id));

    let local = match connect_local(id, inner, &remote, &mut shutdown).await {
        LocalDial::Connected(local) => local,
        LocalDial::RemoteClosed | LocalDial::Shutdown => return LegEnd::Dead,
        LocalDial::Failed(err) => {
            tracing::debug!(leg = %id, error = %err, "Local connection failed");
            inner.emit(LegEvent::Error(err));
            return LegEnd::Ended;
        }
    };

    bridge(id, inner, remote, local, &mut shutdown).await;
    LegEnd::Dead
}

async fn connect_local(
    id: LegId,
    inner: &ClusterInner,
    remote: &TcpStream,
    shutdown: &mut watch::Receiver<bool>,
) -> LocalDial {
    let delay = inner.config.local_retry_delay;
    loop {
        let attempt = tokio::select! {
            attempt = dial_local(inner) => attempt,
            _ = socket::closed_while_idle(remote) => return LocalDial::RemoteClosed,
            _ = wait_for_shutdown(shutdown) => return LocalDial::Shutdown,
        };

        match attempt {
            Ok(local) => return LocalDial::Connected(local),
            Err(e) if socket::is_retryable(&e) => {
                tracing::debug!(leg = %id, error = %e, delay_ms = delay.as_millis() as u64, "Local service unavailable, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = socket::closed_while_idle(remote) => return LocalDial::RemoteClosed,
                    _ = wait_for_shutdown(shutdown) => return LocalDial::Shutdown,
                }
            }
            Err(e) => {
                return LocalDial::Failed(TunnelError::Local {
                    addr: inner.config.local_addr(),
                    source: e,
                })
            }
        }
    }
}

async fn dial_local(inner: &ClusterInner) -> io::Result<LocalStream> {
    let config = &inner.config;
    let tcp = TcpStream::connect((config.local_host.as_str(), config.local_port)).await?;
    match &inner.tls {
        None => Ok(LocalStream::Tcp(tcp)),
        Some((connector, server_name)) => {
            let tls = connector.connect(server_name.clone(), tcp).await?;
            Ok(LocalStream::Tls(Box::new(tls)))
        }
    }
}

async fn bridge(
    id: LegId,
    inner: &ClusterInner,
    remote: TcpStream,
    local: LocalStream,
    shutdown: &mut watch::Receiver<bool>,
) {
    let (mut remote_rd, mut remote_wr) = remote.into_split();
    let (mut local_rd, mut local_wr) = tokio::io::split(local);
    let rewriter = inner.config.host_override.clone().map(HostRewriter::new);

    let upstream = async {
        let forwarded = forward_to_local(inner, &mut remote_rd, &mut local_wr, rewriter, shutdown).await;
        let _ = local_wr.shutdown().await;
        forwarded
    };
    let downstream = async {
        let copied = tokio::io::copy(&mut local_rd, &mut remote_wr).await;
        let _ = remote_wr.shutdown().await;
        copied
    };

    match tokio::try_join!(upstream, downstream) {
        Ok((up, down)) => tracing::debug!(leg = %id, up, down, "Tunnel leg closed"),
        Err(e) => tracing::debug!(leg = %id, error = %e, "Tunnel leg failed"),
    }
}

/// Copy relay bytes to the local service until EOF or shutdown.
async fn forward_to_local<R, W>(
    inner: &ClusterInner,
    remote: &mut R,
    local: &mut W,
    mut rewriter: Option<HostRewriter>,
    shutdown: &mut watch::Receiver<bool>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER];
    let mut out = BytesMut::new();
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            n = remote.read(&mut buf) => n?,
            _ = wait_for_shutdown(shutdown) => 0,
        };

        if n == 0 {
            if let Some(rewriter) = rewriter.as_mut() {
                // Only bytes still held by the rewriter; everything else is written.
                out.clear();
                rewriter.finish(&mut out);
                if !out.is_empty() {
                    local.write_all(&out).await?;
                }
            }
            return Ok(total);
        }

        let chunk = &buf[..n];
        if let Some(request) = parse_request_line(chunk) {
            inner.emit(LegEvent::Request(request));
        }

        match rewriter.as_mut() {
            Some(rewriter) if !rewriter.is_done() => {
                out.clear();
                rewriter.transform(chunk, &mut out);
                local.write_all(&out).await?;
            }
            _ => local.write_all(chunk).await?,
        }
        total += n as u64;
    }
}

/// `METHOD SP PATH` at the start of a chunk.
fn parse_request_line(chunk: &[u8]) -> Option<TunnelRequest> {
    let method_len = chunk
        .iter()
        .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
        .count();
    if method_len == 0 || chunk.get(method_len) != Some(&b' ') {
        return None;
    }

    let rest = &chunk[method_len + 1..];
    let path_len = rest.iter().take_while(|b| !b.is_ascii_whitespace()).count();
    if path_len == 0 {
        return None;
    }

    Some(TunnelRequest {
        method: String::from_utf8_lossy(&chunk[..method_len]).into_owned(),
        path: String::from_utf8_lossy(&rest[..path_len]).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    async fn free_port() -> u16 {
        listener().await.1
    }

    fn config(remote_port: u16, local_port: u16) -> ClusterConfig {
        ClusterConfig {
            remote_host: "127.0.0.1".to_string(),
            remote_port,
            local_host: "127.0.0.1".to_string(),
            local_port,
            local_retry_delay: Duration::from_millis(100),
            ..Default::default()
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ClusterEvent>) -> ClusterEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no cluster event in time")
            .expect("event channel closed")
    }

    /// Local service that answers nothing and hangs up on EOF.
    fn sink_service(listener: TcpListener) {
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = conn.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
            }
        });
    }

    async fn wait_live(cluster: &TunnelCluster, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while cluster.live_legs() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {expected} live legs, have {}", cluster.live_legs()));
    }

    #[test]
    fn parses_request_lines() {
        assert_eq!(
            parse_request_line(b"GET /foo?bar HTTP/1.1\r\n"),
            Some(TunnelRequest {
                method: "GET".to_string(),
                path: "/foo?bar".to_string()
            })
        );
        assert_eq!(parse_request_line(b"POST /x").map(|r| r.path), Some("/x".to_string()));
        assert_eq!(parse_request_line(b"{\"json\": 1}"), None);
        assert_eq!(parse_request_line(b"GET  /double-space"), None);
        assert_eq!(parse_request_line(b"GET "), None);
        assert_eq!(parse_request_line(b""), None);
    }

    #[tokio::test]
    async fn refused_relay_reports_error_without_dead() {
        let (cluster, mut events) = TunnelCluster::new(config(free_port().await, free_port().await)).unwrap();
        cluster.open();

        match next_event(&mut events).await {
            ClusterEvent::Error(TunnelError::RemoteRefused { addr }) => assert!(addr.starts_with("127.0.0.1:")),
            other => panic!("unexpected event {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(cluster.live_legs(), 0);
    }

    #[tokio::test]
    async fn dead_leg_is_replaced_once() {
        let (relay, relay_port) = listener().await;
        let (local, local_port) = listener().await;
        sink_service(local);

        let (cluster, mut events) = TunnelCluster::new(ClusterConfig {
            max_conn: 3,
            ..config(relay_port, local_port)
        })
        .unwrap();
        cluster.start();

        let mut accepted = Vec::new();
        for _ in 0..3 {
            accepted.push(relay.accept().await.unwrap().0);
        }
        wait_live(&cluster, 3).await;

        drop(accepted.remove(0));
        let replacement = tokio::time::timeout(Duration::from_secs(5), relay.accept()).await;
        assert!(replacement.is_ok(), "dead leg was not replaced");
        let _replacement = replacement.unwrap().unwrap();

        let extra = tokio::time::timeout(Duration::from_millis(300), relay.accept()).await;
        assert!(extra.is_err(), "more than one replacement opened");
        wait_live(&cluster, 3).await;

        let mut dead = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ClusterEvent::Dead(_)) {
                dead += 1;
            }
        }
        assert_eq!(dead, 1);
    }

    #[tokio::test]
    async fn retries_local_service_until_it_listens() {
        let (relay, relay_port) = listener().await;
        let local_port = free_port().await;

        let (cluster, mut events) = TunnelCluster::new(config(relay_port, local_port)).unwrap();
        cluster.open();
        let (mut remote, _) = relay.accept().await.unwrap();
        assert!(matches!(next_event(&mut events).await, ClusterEvent::Open(_)));

        // Refused for roughly three attempts.
        tokio::time::sleep(Duration::from_millis(250)).await;
        let local = TcpListener::bind(("127.0.0.1", local_port)).await.unwrap();

        let (mut conn, _) = tokio::time::timeout(Duration::from_secs(2), local.accept())
            .await
            .expect("local service never dialed")
            .unwrap();
        remote.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        assert!(events.try_recv().is_err(), "no event expected while retrying");
    }

    #[tokio::test]
    async fn close_ends_every_leg_without_replacement() {
        let (relay, relay_port) = listener().await;
        let (local, local_port) = listener().await;
        sink_service(local);

        let (cluster, mut events) = TunnelCluster::new(ClusterConfig {
            max_conn: 5,
            ..config(relay_port, local_port)
        })
        .unwrap();
        cluster.start();

        let mut accepted = Vec::new();
        for _ in 0..5 {
            accepted.push(relay.accept().await.unwrap().0);
        }
        wait_live(&cluster, 5).await;

        cluster.close();

        let mut dead = 0;
        loop {
            match next_event(&mut events).await {
                ClusterEvent::Dead(_) => dead += 1,
                ClusterEvent::Closed => break,
                _ => {}
            }
        }
        assert_eq!(dead, 5);
        assert_eq!(cluster.live_legs(), 0);

        let extra = tokio::time::timeout(Duration::from_millis(200), relay.accept()).await;
        assert!(extra.is_err(), "leg reopened after close");
    }

    #[tokio::test]
    async fn rewrites_host_for_local_service() {
        let (relay, relay_port) = listener().await;
        let (local, local_port) = listener().await;

        let (cluster, _events) = TunnelCluster::new(ClusterConfig {
            host_override: Some("localhost".to_string()),
            ..config(relay_port, local_port)
        })
        .unwrap();
        cluster.open();

        let (mut remote, _) = relay.accept().await.unwrap();
        let (mut conn, _) = local.accept().await.unwrap();

        let request = b"GET / HTTP/1.1\r\nHost: demo.example.com\r\n\r\n";
        remote.write_all(request).await.unwrap();

        let expected = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let mut buf = vec![0u8; expected.len()];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected.to_vec());

        conn.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        let mut buf = [0u8; 17];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HTTP/1.1 200 OK\r\n");
    }

    async fn rewriting_leg(host: &str) -> (TunnelCluster, mpsc::UnboundedReceiver<ClusterEvent>, TcpStream, TcpStream) {
        let (relay, relay_port) = listener().await;
        let (local, local_port) = listener().await;

        let (cluster, events) = TunnelCluster::new(ClusterConfig {
            host_override: Some(host.to_string()),
            ..config(relay_port, local_port)
        })
        .unwrap();
        cluster.open();

        let (remote, _) = relay.accept().await.unwrap();
        let (conn, _) = local.accept().await.unwrap();
        (cluster, events, remote, conn)
    }

    async fn read_until_eof(conn: &mut TcpStream) -> Vec<u8> {
        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), conn.read_to_end(&mut received))
            .await
            .expect("local side never saw EOF")
            .unwrap();
        received
    }

    #[tokio::test]
    async fn rewritten_request_is_delivered_once_when_relay_hangs_up() {
        let (_cluster, _events, mut remote, mut conn) = rewriting_leg("localhost").await;

        remote
            .write_all(b"POST /pay HTTP/1.1\r\nHost: demo.example.com\r\n\r\n")
            .await
            .unwrap();
        remote.shutdown().await.unwrap();

        let received = read_until_eof(&mut conn).await;
        assert_eq!(received, b"POST /pay HTTP/1.1\r\nHost: localhost\r\n\r\n".to_vec());
    }

    #[tokio::test]
    async fn rewritten_body_follows_headers_once_on_hang_up() {
        let (_cluster, _events, mut remote, mut conn) = rewriting_leg("localhost").await;

        remote
            .write_all(b"POST /pay HTTP/1.1\r\nHost: demo.example.com\r\nContent-Length: 4\r\n\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        remote.write_all(b"paid").await.unwrap();
        remote.shutdown().await.unwrap();

        let received = read_until_eof(&mut conn).await;
        assert_eq!(
            received,
            b"POST /pay HTTP/1.1\r\nHost: localhost\r\nContent-Length: 4\r\n\r\npaid".to_vec()
        );
    }

    #[tokio::test]
    async fn rewritten_request_is_delivered_once_on_close() {
        let (cluster, mut events, mut remote, mut conn) = rewriting_leg("localhost").await;
        assert!(matches!(next_event(&mut events).await, ClusterEvent::Open(_)));

        remote
            .write_all(b"POST /pay HTTP/1.1\r\nHost: demo.example.com\r\n\r\n")
            .await
            .unwrap();
        assert!(matches!(next_event(&mut events).await, ClusterEvent::Request(_)));
        tokio::time::sleep(Duration::from_millis(50)).await;

        cluster.close();

        let received = read_until_eof(&mut conn).await;
        assert_eq!(received, b"POST /pay HTTP/1.1\r\nHost: localhost\r\n\r\n".to_vec());
    }

    #[tokio::test]
    async fn reports_requests_passing_through() {
        let (relay, relay_port) = listener().await;
        let (local, local_port) = listener().await;
        sink_service(local);

        let (cluster, mut events) = TunnelCluster::new(config(relay_port, local_port)).unwrap();
        cluster.open();
        let (mut remote, _) = relay.accept().await.unwrap();
        assert!(matches!(next_event(&mut events).await, ClusterEvent::Open(_)));

        remote.write_all(b"DELETE /items/7 HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        match next_event(&mut events).await {
            ClusterEvent::Request(request) => {
                assert_eq!(request.method, "DELETE");
                assert_eq!(request.path, "/items/7");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn fatal_local_error_ends_leg_without_dead() {
        let (relay, relay_port) = listener().await;
        let (local, local_port) = listener().await;
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = local.accept().await {
                let _ = conn.write_all(b"this is not a TLS server\r\n\r\n").await;
            }
        });

        let (cluster, mut events) = TunnelCluster::new(ClusterConfig {
            local_https: true,
            local_tls: LocalTlsOptions {
                allow_invalid_cert: true,
                ..Default::default()
            },
            ..config(relay_port, local_port)
        })
        .unwrap();
        cluster.open();
        let (mut remote, _) = relay.accept().await.unwrap();

        assert!(matches!(next_event(&mut events).await, ClusterEvent::Open(_)));
        assert!(matches!(
            next_event(&mut events).await,
            ClusterEvent::Error(TunnelError::Local { .. })
        ));

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), remote.read(&mut buf)).await.unwrap().unwrap_or(0);
        assert_eq!(n, 0, "relay side should be closed");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(cluster.live_legs(), 0);
    }
}
