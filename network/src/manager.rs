use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::communication::PeerClient;
use crate::{Config, NodeAddress, Result};

/// One cached connection per peer node id, created lazily.
pub struct ClientManager {
    clients: DashMap<String, Arc<PeerClient>>,
    request_timeout: Duration,
}

impl ClientManager {
    pub fn new(config: &Config) -> Self {
        Self {
            clients: DashMap::new(),
            request_timeout: config.request_timeout(),
        }
    }

    /// Opens a connection that is not yet tied to a node id, for talking to
    /// a peer whose identity is still unknown.
    pub async fn connect(&self, address: &NodeAddress) -> Result<Arc<PeerClient>> {
        Ok(Arc::new(
            PeerClient::connect(address.clone(), self.request_timeout).await?,
        ))
    }

    /// Caches `client` for `node_id` unless a live client is already cached,
    /// in which case `client` is closed. Returns the cached client; other
    /// tasks may be waiting on it, so it is never replaced while open.
    pub fn register(&self, node_id: &str, client: Arc<PeerClient>) -> Arc<PeerClient> {
        let registered = {
            let mut cached = self
                .clients
                .entry(node_id.to_string())
                .or_insert_with(|| client.clone());
            if cached.is_closed() {
                *cached = client.clone();
            }
            cached.value().clone()
        };
        if Arc::ptr_eq(&registered, &client) {
            tracing::debug!("Registered client for node {} at {}", node_id, client.address());
        } else {
            client.close();
        }
        registered
    }

    /// Live client for `node_id`, if one is cached.
    pub fn get(&self, node_id: &str) -> Option<Arc<PeerClient>> {
        let client = self.clients.get(node_id)?.value().clone();
        if client.is_closed() {
            self.clients.remove_if(node_id, |_, cached| Arc::ptr_eq(cached, &client));
            return None;
        }
        Some(client)
    }

    pub async fn get_or_connect(
        &self,
        node_id: &str,
        address: &NodeAddress,
    ) -> Result<Arc<PeerClient>> {
        if let Some(client) = self.get(node_id) {
            return Ok(client);
        }
        tracing::debug!("Opening connection to node {} at {}", node_id, address);
        let client = self.connect(address).await?;
        // another task may have connected meanwhile; keep whichever landed first
        let client = self
            .clients
            .entry(node_id.to_string())
            .and_modify(|cached| {
                if cached.is_closed() {
                    *cached = client.clone();
                }
            })
            .or_insert_with(|| client.clone())
            .value()
            .clone();
        Ok(client)
    }

    pub fn remove(&self, node_id: &str) {
        if let Some((_, client)) = self.clients.remove(node_id) {
            client.close();
        }
    }

    /// Closes every cached connection, failing their pending requests.
    pub fn close_all(&self) {
        for entry in self.clients.iter() {
            entry.value().close();
        }
        self.clients.clear();
    }
}
