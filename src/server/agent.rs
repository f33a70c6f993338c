//! Per-tunnel pool of connections donated by the tunnel client.
//!
//! # Responsibilities
//! - Listen on a dedicated port for the client's legs
//! - Cap the number of live connections
//! - Hand connections to claimers in FIFO order on both sides
//! - Report online/offline transitions of the pool
//!
//! # Data Flow
//! ```text
//! leg connects → capacity check → oldest pending claim
//!                                 or available queue (idle watcher)
//! claim()      → oldest available connection
//!                or pending claim queue
//! TunnelStream dropped → release: connected -= 1, Offline at zero
//! ```
//!
//! # Design Decisions
//! - One mutex per agent, never held across `.await` or while a stream drops
//! - Each idle connection is owned by a watcher task that notices a peer
//!   close; claiming asks the watcher to hand the stream over
//! - Pending claims are oneshot slots, so closing the pool resolves all of them

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot, watch};

use crate::net::socket;
use crate::observability::metrics;

/// Upper bound on live connections per tunnel.
pub const DEFAULT_MAX_SOCKETS: usize = 10;

static SOCKET_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifier of one pooled connection, for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(u64);

impl SocketId {
    fn next() -> Self {
        Self(SOCKET_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sock-{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("tunnel agent already started")]
    AlreadyStarted,
    #[error("failed to bind tunnel listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("tunnel agent closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Session id, used in logs.
    pub client_id: String,
    /// Maximum live connections.
    pub max_tcp_sockets: usize,
    /// Listener address, port 0 picks a free port.
    pub bind_address: String,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            max_tcp_sockets: DEFAULT_MAX_SOCKETS,
            bind_address: "0.0.0.0:0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AgentStats {
    pub connected_sockets: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ListenInfo {
    pub port: u16,
    pub local_addr: SocketAddr,
}

/// Pool transitions, broadcast on every occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    /// First live connection arrived.
    Online,
    /// Last live connection went away.
    Offline,
    /// The agent shut down.
    Closed,
}

type ClaimResult = Result<TunnelStream, AgentError>;

/// Handle on an idle connection owned by its watcher task.
struct IdleSlot {
    id: SocketId,
    take: oneshot::Sender<oneshot::Sender<TunnelStream>>,
}

impl IdleSlot {
    /// Ask the watcher for the stream. `None` if it closed meanwhile.
    async fn take(self) -> Option<TunnelStream> {
        let (reply, stream) = oneshot::channel();
        self.take.send(reply).ok()?;
        stream.await.ok()
    }
}

#[derive(Default)]
struct AgentState {
    started: bool,
    closed: bool,
    connected: usize,
    available: VecDeque<IdleSlot>,
    waiting: VecDeque<oneshot::Sender<ClaimResult>>,
}

enum Ticket {
    Closed,
    Idle(IdleSlot),
    Waiting(oneshot::Receiver<ClaimResult>),
}

enum Placement {
    Waiter(oneshot::Sender<ClaimResult>),
    Parked(oneshot::Receiver<oneshot::Sender<TunnelStream>>),
    Closed,
}

struct Shared {
    client_id: String,
    capacity: usize,
    bind_address: String,
    state: Mutex<AgentState>,
    events: broadcast::Sender<AgentEvent>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: AgentEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn on_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let id = SocketId::next();
        let connected = {
            let mut state = self.lock();
            if state.closed {
                None
            } else if state.connected >= self.capacity {
                tracing::debug!(client_id = %self.client_id, peer = %peer, "No more sockets allowed");
                metrics::record_socket_rejected();
                None
            } else {
                if state.connected == 0 {
                    self.emit(AgentEvent::Online);
                }
                state.connected += 1;
                Some(state.connected)
            }
        };
        let Some(connected) = connected else {
            drop(stream);
            return;
        };

        tracing::debug!(client_id = %self.client_id, socket = %id, peer = %peer, connected, "New tunnel connection");
        let stream = TunnelStream {
            io: TokioIo::new(stream),
            peer,
            lease: Lease {
                shared: Arc::clone(self),
                id,
            },
        };
        self.place(stream);
    }

    /// Give a live connection to the oldest pending claim, or park it.
    fn place(self: &Arc<Self>, mut stream: TunnelStream) {
        loop {
            let placement = {
                let mut state = self.lock();
                if state.closed {
                    Placement::Closed
                } else if let Some(waiter) = state.waiting.pop_front() {
                    Placement::Waiter(waiter)
                } else {
                    let (take, requests) = oneshot::channel();
                    state.available.push_back(IdleSlot { id: stream.id(), take });
                    Placement::Parked(requests)
                }
            };

            match placement {
                Placement::Closed => {
                    drop(stream);
                    return;
                }
                Placement::Parked(requests) => {
                    tokio::spawn(watch_idle(stream, requests));
                    return;
                }
                Placement::Waiter(waiter) => match waiter.send(Ok(stream)) {
                    Ok(()) => {
                        tracing::trace!(client_id = %self.client_id, "Connection handed to queued claim");
                        return;
                    }
                    // Claimer went away, try the next one.
                    Err(Ok(returned)) => stream = returned,
                    Err(Err(_)) => return,
                },
            }
        }
    }

    fn ticket(&self) -> Ticket {
        self.enqueue(false)
    }

    /// Ticket for a claim whose idle connection vanished; it keeps its turn.
    fn retry_ticket(&self) -> Ticket {
        self.enqueue(true)
    }

    fn enqueue(&self, front: bool) -> Ticket {
        let mut state = self.lock();
        if state.closed {
            return Ticket::Closed;
        }
        if let Some(slot) = state.available.pop_front() {
            return Ticket::Idle(slot);
        }
        // Claims dropped before resolving.
        state.waiting.retain(|waiter| !waiter.is_closed());
        let (tx, rx) = oneshot::channel();
        if front {
            state.waiting.push_front(tx);
        } else {
            state.waiting.push_back(tx);
        }
        tracing::trace!(
            client_id = %self.client_id,
            connected = state.connected,
            waiting = state.waiting.len(),
            "Waiting for a tunnel connection"
        );
        Ticket::Waiting(rx)
    }

    fn release(&self, id: SocketId) {
        let (slot, connected) = {
            let mut state = self.lock();
            state.connected = state.connected.saturating_sub(1);
            let slot = state
                .available
                .iter()
                .position(|slot| slot.id == id)
                .and_then(|pos| state.available.remove(pos));
            if state.connected == 0 && !state.closed {
                self.emit(AgentEvent::Offline);
            }
            (slot, state.connected)
        };
        drop(slot);
        tracing::trace!(client_id = %self.client_id, socket = %id, connected, "Tunnel connection closed");
    }

    fn on_close(&self) {
        let (waiting, available) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.waiting),
                std::mem::take(&mut state.available),
            )
        };

        for waiter in waiting {
            let _ = waiter.send(Err(AgentError::Closed));
        }
        // Dropping the slots makes every idle watcher drop its stream.
        drop(available);

        tracing::debug!(client_id = %self.client_id, "Tunnel agent closed");
        self.emit(AgentEvent::Closed);
    }
}

/// Pool of connections for one tunnel session. Cheap to clone.
#[derive(Clone)]
pub struct TunnelAgent {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TunnelAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelAgent")
            .field("client_id", &self.shared.client_id)
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

impl TunnelAgent {
    pub fn new(options: AgentOptions) -> Self {
        let (events, _) = broadcast::channel(16);
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                client_id: options.client_id,
                capacity: options.max_tcp_sockets,
                bind_address: options.bind_address,
                state: Mutex::new(AgentState::default()),
                events,
                shutdown,
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    /// Bind the listener and start accepting legs.
    pub async fn listen(&self) -> Result<ListenInfo, AgentError> {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(AgentError::Closed);
            }
            if state.started {
                return Err(AgentError::AlreadyStarted);
            }
            state.started = true;
        }

        let addr = self.shared.bind_address.clone();
        let bind_error = |source| AgentError::Bind {
            addr: addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        tracing::debug!(client_id = %self.shared.client_id, port = local_addr.port(), "Tunnel listener started");

        let shutdown = self.shared.shutdown.subscribe();
        tokio::spawn(accept_loop(Arc::clone(&self.shared), listener, shutdown));

        Ok(ListenInfo {
            port: local_addr.port(),
            local_addr,
        })
    }

    /// Obtain a connection to the tunnel client.
    ///
    /// The claim is queued when this is called, not when the future is first
    /// polled, so claims are served in call order.
    pub fn claim(&self) -> impl Future<Output = ClaimResult> + Send + 'static {
        let shared = Arc::clone(&self.shared);
        let first = shared.ticket();
        async move {
            let mut ticket = first;
            loop {
                match ticket {
                    Ticket::Closed => return Err(AgentError::Closed),
                    Ticket::Waiting(rx) => return rx.await.unwrap_or(Err(AgentError::Closed)),
                    Ticket::Idle(slot) => {
                        if let Some(stream) = slot.take().await {
                            return Ok(stream);
                        }
                        ticket = shared.retry_ticket();
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            connected_sockets: self.shared.lock().connected,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Stop listening and fail every pending and future claim. Idempotent.
    pub fn destroy(&self) {
        self.shared.shutdown.send_replace(true);
        self.shared.on_close();
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => shared.on_connection(stream, peer),
                Err(e) => {
                    tracing::warn!(client_id = %shared.client_id, error = %e, "Failed to accept tunnel connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            _ = shutdown.changed() => {}
        }
    }
    drop(listener);
    shared.on_close();
}

/// Owns an idle connection until it is claimed or closes.
async fn watch_idle(stream: TunnelStream, mut requests: oneshot::Receiver<oneshot::Sender<TunnelStream>>) {
    let request = tokio::select! {
        request = &mut requests => Some(request),
        _ = socket::closed_while_idle(stream.tcp()) => None,
    };

    match request {
        Some(Ok(reply)) => {
            if let Err(stream) = reply.send(stream) {
                // Claim was cancelled mid-handover.
                let shared = Arc::clone(&stream.lease.shared);
                shared.place(stream);
            }
        }
        Some(Err(_)) => {
            // Slot dropped: either the pool closed or a claim was cancelled.
            let shared = Arc::clone(&stream.lease.shared);
            shared.place(stream);
        }
        None => {
            tracing::trace!(socket = %stream.id(), "Idle tunnel connection closed by peer");
        }
    }
}

/// Releases the connection's place in the pool on drop.
struct Lease {
    shared: Arc<Shared>,
    id: SocketId,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.shared.release(self.id);
    }
}

/// A connection claimed from the pool.
///
/// Usable both with tokio IO traits and as a hyper transport. Dropping it
/// closes the connection and frees its place in the pool.
pub struct TunnelStream {
    io: TokioIo<TcpStream>,
    peer: SocketAddr,
    lease: Lease,
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream")
            .field("id", &self.lease.id)
            .field("peer", &self.peer)
            .finish()
    }
}

impl TunnelStream {
    pub fn id(&self) -> SocketId {
        self.lease.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn tcp(&self) -> &TcpStream {
        self.io.inner()
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.get_mut().io.inner_mut()).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(self.get_mut().io.inner_mut()).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.get_mut().io.inner_mut()).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.get_mut().io.inner_mut()).poll_shutdown(cx)
    }
}

impl hyper::rt::Read for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<Result<(), io::Error>> {
        hyper::rt::Read::poll_read(Pin::new(&mut self.get_mut().io), cx, buf)
    }
}

impl hyper::rt::Write for TunnelStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, io::Error>> {
        hyper::rt::Write::poll_write(Pin::new(&mut self.get_mut().io), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        hyper::rt::Write::poll_flush(Pin::new(&mut self.get_mut().io), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        hyper::rt::Write::poll_shutdown(Pin::new(&mut self.get_mut().io), cx)
    }
}

impl Connection for TunnelStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Connection source for hyper-util's pooled client.
///
/// The destination URI is ignored; every connection comes from the agent.
#[derive(Debug, Clone)]
pub struct AgentConnector {
    agent: TunnelAgent,
}

impl AgentConnector {
    pub fn new(agent: TunnelAgent) -> Self {
        Self { agent }
    }
}

impl tower::Service<Uri> for AgentConnector {
    type Response = TunnelStream;
    type Error = AgentError;
    type Future = Pin<Box<dyn Future<Output = ClaimResult> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _dst: Uri) -> Self::Future {
        Box::pin(self.agent.claim())
    }
}
