//! Registry of tunnel sessions keyed by id.
//!
//! # Responsibilities
//! - Allocate ids (requested or random) and start a pool per session
//! - Keep the tunnel count in line with the registry
//! - Drop sessions from the registry once they close
//!
//! # Design Decisions
//! - A session is only registered after its listener is up
//! - Removal on close checks identity, so a newer session with the same id
//!   is never removed by an older one closing

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;

use crate::config::schema::TunnelConfig;
use crate::observability::metrics;
use crate::server::agent::{AgentError, AgentOptions, TunnelAgent, DEFAULT_MAX_SOCKETS};
use crate::server::client::Client;
use crate::server::ids;

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Connection count advertised to tunnel clients.
    pub max_sockets: Option<usize>,
    /// Live connections accepted per session.
    pub pool_capacity: usize,
    /// Listener address for session pools.
    pub agent_bind_address: String,
    /// How long a session may have no live connection.
    pub offline_grace: Option<Duration>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            max_sockets: Some(DEFAULT_MAX_SOCKETS),
            pool_capacity: DEFAULT_MAX_SOCKETS,
            agent_bind_address: "0.0.0.0:0".to_string(),
            offline_grace: Some(Duration::from_secs(1)),
        }
    }
}

impl From<&TunnelConfig> for ManagerOptions {
    fn from(config: &TunnelConfig) -> Self {
        Self {
            max_sockets: Some(config.max_sockets),
            pool_capacity: config.pool_capacity,
            agent_bind_address: config.agent_bind_address.clone(),
            offline_grace: (config.offline_grace_ms > 0).then(|| Duration::from_millis(config.offline_grace_ms)),
        }
    }
}

/// Returned to a tunnel client that was allocated a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewClientInfo {
    pub id: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_conn_count: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub tunnels: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Agent(#[from] AgentError),
}

pub struct ClientManager {
    clients: DashMap<String, Arc<Client>>,
    tunnels: AtomicUsize,
    options: ManagerOptions,
}

impl ClientManager {
    pub fn new(options: ManagerOptions) -> Arc<Self> {
        Arc::new(Self {
            clients: DashMap::new(),
            tunnels: AtomicUsize::new(0),
            options,
        })
    }

    /// Start a session, using `requested_id` when it is free.
    pub async fn new_client(self: &Arc<Self>, requested_id: Option<&str>) -> Result<NewClientInfo, ManagerError> {
        let mut requested = requested_id.filter(|id| !self.clients.contains_key(*id));

        loop {
            let id = match requested.take() {
                Some(id) => id.to_string(),
                None => self.unused_random_id(),
            };

            let agent = TunnelAgent::new(AgentOptions {
                client_id: id.clone(),
                max_tcp_sockets: self.options.pool_capacity,
                bind_address: self.options.agent_bind_address.clone(),
            });
            let client = Client::new(id.clone(), agent.clone(), self.options.offline_grace);

            let info = match agent.listen().await {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!(client_id = %id, error = %e, "Failed to start tunnel listener");
                    client.close();
                    return Err(e.into());
                }
            };

            match self.clients.entry(id.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(Arc::clone(&client));
                }
                Entry::Occupied(_) => {
                    // Taken while the listener was starting.
                    client.close();
                    continue;
                }
            }

            let tunnels = self.tunnels.fetch_add(1, Ordering::SeqCst) + 1;
            metrics::record_tunnel_created(tunnels);
            tracing::info!(client_id = %id, port = info.port, tunnels, "Tunnel session created");

            tokio::spawn(remove_on_close(Arc::downgrade(self), Arc::clone(&client)));

            return Ok(NewClientInfo {
                id,
                port: info.port,
                max_conn_count: self.options.max_sockets,
            });
        }
    }

    /// Deregister and close a session. Idempotent.
    pub fn remove_client(&self, id: &str) {
        if let Some((_, client)) = self.clients.remove(id) {
            self.on_removed(&client);
        }
    }

    fn remove_instance(&self, client: &Arc<Client>) {
        if let Some((_, client)) = self.clients.remove_if(client.id(), |_, current| Arc::ptr_eq(current, client)) {
            self.on_removed(&client);
        }
    }

    fn on_removed(&self, client: &Client) {
        let tunnels = self.tunnels.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::record_tunnel_removed(tunnels);
        tracing::info!(client_id = %client.id(), tunnels, "Tunnel session removed");
        client.close();
    }

    pub fn get_client(&self, id: &str) -> Option<Arc<Client>> {
        self.clients.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn has_client(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            tunnels: self.tunnels.load(Ordering::SeqCst),
        }
    }

    /// Close every session.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.clients.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.remove_client(&id);
        }
    }

    fn unused_random_id(&self) -> String {
        loop {
            let id = ids::random_id();
            if !self.clients.contains_key(&id) {
                return id;
            }
        }
    }
}

async fn remove_on_close(manager: Weak<ClientManager>, client: Arc<Client>) {
    client.closed().await;
    if let Some(manager) = manager.upgrade() {
        manager.remove_instance(&client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    fn manager(offline_grace: Option<Duration>) -> Arc<ClientManager> {
        ClientManager::new(ManagerOptions {
            agent_bind_address: "127.0.0.1:0".to_string(),
            offline_grace,
            ..Default::default()
        })
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn creates_client_with_random_id() {
        let manager = manager(None);
        let info = manager.new_client(None).await.unwrap();

        assert!(ids::is_valid_subdomain(&info.id));
        assert_ne!(info.port, 0);
        assert_eq!(info.max_conn_count, Some(DEFAULT_MAX_SOCKETS));
        assert!(manager.has_client(&info.id));
        assert_eq!(manager.stats().tunnels, 1);
    }

    #[tokio::test]
    async fn uses_requested_id_when_free() {
        let manager = manager(None);
        let info = manager.new_client(Some("foobar")).await.unwrap();
        assert_eq!(info.id, "foobar");

        let second = manager.new_client(Some("foobar")).await.unwrap();
        assert_ne!(second.id, "foobar");
        assert_eq!(manager.stats().tunnels, 2);
    }

    #[tokio::test]
    async fn remove_client_is_idempotent() {
        let manager = manager(None);
        let info = manager.new_client(Some("foobar")).await.unwrap();
        let client = manager.get_client("foobar").unwrap();

        manager.remove_client(&info.id);
        manager.remove_client(&info.id);

        assert!(!manager.has_client("foobar"));
        assert_eq!(manager.stats().tunnels, 0);
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn closed_client_is_removed() {
        let manager = manager(None);
        manager.new_client(Some("foobar")).await.unwrap();
        manager.get_client("foobar").unwrap().close();

        wait_until(|| !manager.has_client("foobar")).await;
        assert_eq!(manager.stats().tunnels, 0);
    }

    #[tokio::test]
    async fn stale_close_does_not_remove_newer_session() {
        let manager = manager(None);
        manager.new_client(Some("foobar")).await.unwrap();
        let old = manager.get_client("foobar").unwrap();

        manager.remove_client("foobar");
        manager.new_client(Some("foobar")).await.unwrap();
        old.close();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let current = manager.get_client("foobar").unwrap();
        assert!(!Arc::ptr_eq(&old, &current));
        assert_eq!(manager.stats().tunnels, 1);
    }

    #[tokio::test]
    async fn abandoned_session_is_evicted_after_grace() {
        let manager = manager(Some(Duration::from_millis(50)));
        manager.new_client(Some("foobar")).await.unwrap();

        wait_until(|| !manager.has_client("foobar")).await;
        assert_eq!(manager.stats().tunnels, 0);
    }

    #[tokio::test]
    async fn connected_session_survives_grace() {
        let manager = manager(Some(Duration::from_millis(100)));
        let info = manager.new_client(Some("foobar")).await.unwrap();
        let _leg = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(manager.has_client("foobar"));
    }

    #[tokio::test]
    async fn listen_failure_registers_nothing() {
        let manager = ClientManager::new(ManagerOptions {
            agent_bind_address: "256.0.0.1:0".to_string(),
            offline_grace: None,
            ..Default::default()
        });
        let err = manager.new_client(Some("foobar")).await.unwrap_err();
        assert!(matches!(err, ManagerError::Agent(AgentError::Bind { .. })));
        assert!(!manager.has_client("foobar"));
        assert_eq!(manager.stats().tunnels, 0);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let manager = manager(None);
        manager.new_client(None).await.unwrap();
        manager.new_client(None).await.unwrap();
        manager.shutdown();
        assert_eq!(manager.stats().tunnels, 0);
    }
}
