use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures::future::join_all;
use network::{
    ClientManager, Command, InfoCommand, NodeAddress, NodeCommand, PeerClient, RpcRequest,
};
use storage::{BucketInfo, BucketManager, BucketSink, CacheEntry, Wal};
use tokio::sync::{RwLock, Semaphore};

use crate::map::ClusterMap;
use crate::node::NodeInfo;
use crate::{ClusterError, Config, Result};

/// Pushes writes from a primary to its replicas and bootstraps new ones.
///
/// Replicated writes are fire-and-forget: each target gets its own task on
/// the replication pool and failures are only logged. A replica receives
/// writes once a full bootstrap to it has succeeded.
pub struct ReplicationManager {
    buckets: Arc<BucketManager>,
    clients: Arc<ClientManager>,
    cluster_map: Arc<RwLock<ClusterMap>>,
    wal: Arc<Wal>,
    targets: RwLock<BTreeMap<String, NodeInfo>>,
    in_sync: RwLock<BTreeSet<String>>,
    permits: Arc<Semaphore>,
    config: Config,
}

impl ReplicationManager {
    pub fn new(
        config: Config,
        buckets: Arc<BucketManager>,
        clients: Arc<ClientManager>,
        cluster_map: Arc<RwLock<ClusterMap>>,
        wal: Arc<Wal>,
    ) -> Self {
        Self {
            buckets,
            clients,
            cluster_map,
            wal,
            targets: RwLock::new(BTreeMap::new()),
            in_sync: RwLock::new(BTreeSet::new()),
            permits: Arc::new(Semaphore::new(config.max_concurrent_replication.max(1))),
            config,
        }
    }

    /// Replicas that have been bootstrapped and are still in the cluster map
    /// as followers of `primary_id`.
    pub async fn targets(&self, primary_id: &str) -> Vec<NodeInfo> {
        let registered = self.targets.read().await;
        let map = self.cluster_map.read().await;
        map.replicas_of(primary_id)
            .into_iter()
            .filter(|replica| registered.contains_key(&replica.node_id))
            .collect()
    }

    pub async fn in_sync_replicas(&self) -> Vec<String> {
        self.in_sync.read().await.iter().cloned().collect()
    }

    /// Called on every local write: no replica is known to have it yet.
    pub async fn clear_in_sync(&self) {
        self.in_sync.write().await.clear();
    }

    pub async fn clear_targets(&self) {
        self.targets.write().await.clear();
        self.in_sync.write().await.clear();
    }

    pub async fn replicate_put(
        &self,
        primary_id: &str,
        entries: Vec<CacheEntry>,
        node_version: u64,
    ) {
        let targets = self.targets(primary_id).await;
        if targets.is_empty() {
            return;
        }
        let entries = Arc::new(entries);
        let (batch_size, max_retries) = (
            self.config.replication_batch_size,
            self.config.replication_max_retries,
        );

        for target in targets {
            let entries = entries.clone();
            self.spawn_on_pool(target, move |client| async move {
                client
                    .put_all(&entries, Some(node_version), batch_size, max_retries)
                    .await
            });
        }
    }

    pub async fn replicate_delete(&self, primary_id: &str, keys: Vec<String>, node_version: u64) {
        let targets = self.targets(primary_id).await;
        for target in targets {
            let command = Command::Delete(keys.clone());
            self.spawn_on_pool(target, move |client| async move {
                let request = RpcRequest::new(command).with_node_version(node_version);
                let response = client.call(request).await?;
                if !response.is_ok() {
                    return Err(network::NetworkError::Protocol(format!(
                        "replicated DELETE answered {}",
                        response.status
                    )));
                }
                Ok(())
            });
        }
    }

    fn spawn_on_pool<F, Fut>(&self, target: NodeInfo, task: F)
    where
        F: FnOnce(Arc<PeerClient>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = network::Result<()>> + Send + 'static,
    {
        let clients = self.clients.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let result = match clients.get_or_connect(&target.node_id, &target.address).await {
                Ok(client) => task(client).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::warn!("Replication to {} failed: {}", target, e);
            }
        });
    }

    /// Streams every local bucket to `replica`, one task per bucket. Only when
    /// all streams succeed is the replica registered as a target and in sync.
    pub async fn replicate_data_to(&self, primary: &NodeInfo, replica: &NodeInfo) -> bool {
        let client = match self
            .clients
            .get_or_connect(&replica.node_id, &replica.address)
            .await
        {
            Ok(client) => client,
            Err(e) => {
                tracing::error!("Cannot bootstrap replica {}: {}", replica, e);
                return false;
            }
        };

        let sink = Arc::new(ReplicaSink {
            client,
            node_version: self.wal.current_version(),
            batch_size: self.config.replication_batch_size,
            max_retries: self.config.replication_max_retries,
        });

        let buckets = self.buckets.local_buckets().await;
        let count = buckets.len();
        tracing::info!("Bootstrapping replica {} with {} buckets", replica, count);

        let streams = buckets.into_iter().map(|bucket| {
            let sink = sink.clone();
            let permits = self.permits.clone();
            tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return false;
                };
                bucket.stream_to(sink.as_ref()).await
            })
        });
        let succeeded = join_all(streams)
            .await
            .into_iter()
            .all(|joined| matches!(joined, Ok(true)));

        if !succeeded {
            tracing::error!("Bootstrap of replica {} failed; it will not receive writes", replica);
            return false;
        }

        self.cluster_map
            .write()
            .await
            .add_replica(primary, replica.clone());
        self.targets
            .write()
            .await
            .insert(replica.node_id.clone(), replica.clone());
        self.in_sync.write().await.insert(replica.node_id.clone());
        tracing::info!("Replica {} bootstrapped ({} buckets)", replica, count);
        true
    }

    /// Replica side of bootstrap: adopt the primary's bucket layout, then ask
    /// the primary to add `local_address` to its replica set.
    pub async fn initiate_replication_of(
        &self,
        primary: &NodeInfo,
        local_address: &NodeAddress,
    ) -> Result<()> {
        let client = self
            .clients
            .get_or_connect(&primary.node_id, &primary.address)
            .await?;

        let response = client.send(Command::Info(InfoCommand::BucketMap)).await?;
        if !response.is_ok() {
            return Err(ClusterError::Remote {
                node: primary.node_id.clone(),
                status: response.status,
                message: response.payload_str().to_string(),
            });
        }
        let layout: Vec<BucketInfo> = serde_json::from_str(response.payload_str())?;
        self.buckets.create_from_primary(layout).await;

        let response = client
            .send(Command::Node(NodeCommand::Primarize(vec![local_address.clone()])))
            .await?;
        if !response.is_ok() {
            return Err(ClusterError::Remote {
                node: primary.node_id.clone(),
                status: response.status,
                message: response.payload_str().to_string(),
            });
        }
        Ok(())
    }
}

struct ReplicaSink {
    client: Arc<PeerClient>,
    node_version: u64,
    batch_size: usize,
    max_retries: usize,
}

#[async_trait]
impl BucketSink for ReplicaSink {
    async fn put_batch(&self, bucket_id: &str, entries: Vec<CacheEntry>) -> anyhow::Result<()> {
        self.client
            .put_all(
                &entries,
                Some(self.node_version),
                self.batch_size,
                self.max_retries,
            )
            .await
            .with_context(|| format!("streaming bucket {} to {}", bucket_id, self.client.address()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use network::{read_frame, write_frame, RpcResponse};
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    /// Peer that acknowledges every request and records PUT keys.
    async fn recording_peer(fail: bool) -> (NodeAddress, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let keys = Arc::new(Mutex::new(Vec::new()));
        let seen = keys.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let seen = seen.clone();
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.into_split();
                    while let Ok(Some(request)) = read_frame::<_, RpcRequest>(&mut r).await {
                        if let Command::Put(entries) = &request.command {
                            assert!(request.node_version.is_some());
                            seen.lock().unwrap().extend(entries.iter().map(|e| e.key.clone()));
                        }
                        let response = if fail {
                            RpcResponse::error("refused")
                        } else {
                            RpcResponse::ok()
                        };
                        let response = response.with_correlation_id(request.correlation_id);
                        if write_frame(&mut w, &response).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (NodeAddress::new("127.0.0.1", port), keys)
    }

    async fn manager_with(entries: &[&str]) -> (ReplicationManager, Arc<RwLock<ClusterMap>>) {
        let buckets = Arc::new(BucketManager::new("primary", 4));
        for key in entries {
            buckets.put(CacheEntry::persistent(*key, "v")).await.unwrap();
        }
        let clients = Arc::new(ClientManager::new(&network::Config::default()));
        let map = Arc::new(RwLock::new(ClusterMap::new(0)));
        let manager = ReplicationManager::new(
            Config::default(),
            buckets,
            clients,
            map.clone(),
            Arc::new(Wal::new()),
        );
        (manager, map)
    }

    fn primary_info() -> NodeInfo {
        NodeInfo::new("primary", NodeAddress::new("127.0.0.1", 1))
    }

    #[tokio::test]
    async fn bootstrap_streams_every_key_and_registers_target() {
        let (manager, map) = manager_with(&["a", "b", "c", "d", "e"]).await;
        let (address, keys) = recording_peer(false).await;
        let replica = NodeInfo::new("replica", address);

        assert!(manager.replicate_data_to(&primary_info(), &replica).await);

        let mut streamed = keys.lock().unwrap().clone();
        streamed.sort();
        assert_eq!(streamed, vec!["a", "b", "c", "d", "e"]);
        assert!(map.read().await.is_replica_of("replica", "primary"));
        assert_eq!(manager.targets("primary").await, vec![replica]);
        assert_eq!(manager.in_sync_replicas().await, vec!["replica".to_string()]);

        manager.clear_in_sync().await;
        assert!(manager.in_sync_replicas().await.is_empty());
    }

    #[tokio::test]
    async fn failed_bootstrap_leaves_replica_unregistered() {
        let (manager, map) = manager_with(&["a"]).await;
        let (address, _) = recording_peer(true).await;
        let replica = NodeInfo::new("replica", address);

        assert!(!manager.replicate_data_to(&primary_info(), &replica).await);
        assert!(map.read().await.replicas_of("primary").is_empty());
        assert!(manager.targets("primary").await.is_empty());
    }

    #[tokio::test]
    async fn writes_fan_out_only_to_bootstrapped_replicas() {
        let (manager, map) = manager_with(&[]).await;
        let (ready_addr, ready_keys) = recording_peer(false).await;
        let (pending_addr, pending_keys) = recording_peer(false).await;
        let ready = NodeInfo::new("ready", ready_addr);
        let pending = NodeInfo::new("pending", pending_addr);

        assert!(manager.replicate_data_to(&primary_info(), &ready).await);
        map.write().await.add_replica(&primary_info(), pending);

        manager
            .replicate_put("primary", vec![CacheEntry::persistent("x", "1")], 1)
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        assert_eq!(ready_keys.lock().unwrap().clone(), vec!["x"]);
        assert!(pending_keys.lock().unwrap().is_empty());
    }
}
