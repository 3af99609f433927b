use std::sync::Arc;

use network::{
    ClientManager, Command, InfoCommand, NodeAddress, NodeCommand, NodeInfoKind, PeerClient,
    RpcRequest, RpcResponse,
};
use storage::CacheEntry;
use tokio::sync::RwLock;

use crate::map::ClusterMap;
use crate::node::{NodeInfo, NodeRole};
use crate::replication::ReplicationManager;
use crate::{ClusterError, Config, Result};

/// Runs the STANDALONE / PRIMARY / REPLICA state machine and owns the
/// cluster map.
///
/// Each transition validates its target before touching local state. No lock
/// is held across a network call: transitions call back into this node
/// (a new replica registers itself through PRIMARIZE), so holding one would
/// deadlock. A failure after the role has flipped is not rolled back.
pub struct ClusterOrchestrator {
    local: RwLock<NodeInfo>,
    cluster_map: Arc<RwLock<ClusterMap>>,
    clients: Arc<ClientManager>,
    replication: Arc<ReplicationManager>,
    config: Config,
}

impl ClusterOrchestrator {
    pub fn new(
        config: Config,
        local: NodeInfo,
        cluster_map: Arc<RwLock<ClusterMap>>,
        clients: Arc<ClientManager>,
        replication: Arc<ReplicationManager>,
    ) -> Self {
        Self {
            local: RwLock::new(local),
            cluster_map,
            clients,
            replication,
            config,
        }
    }

    pub async fn local_info(&self) -> NodeInfo {
        self.local.read().await.clone()
    }

    pub async fn role(&self) -> NodeRole {
        self.local.read().await.role
    }

    pub async fn cluster_map(&self) -> ClusterMap {
        self.cluster_map.read().await.clone()
    }

    pub fn replication(&self) -> &Arc<ReplicationManager> {
        &self.replication
    }

    /// Makes the node at `target` a replica of this node.
    pub async fn primarize(&self, target: &NodeAddress) -> Result<()> {
        self.ensure_not_self(target, "primarize").await?;

        let local = self.local_info().await;
        if local.is_replica() {
            let primary = self.own_primary(&local).await?;
            tracing::info!(
                "Node {} is a replica; forwarding PRIMARIZE {} to primary {}",
                local.node_id,
                target,
                primary
            );
            let client = self
                .clients
                .get_or_connect(&primary.node_id, &primary.address)
                .await?;
            let response = client
                .send(Command::Node(NodeCommand::Primarize(vec![target.clone()])))
                .await?;
            return expect_ok(&primary.node_id, &response);
        }

        let client = self.clients.connect(target).await?;
        let mut replica = fetch_node_info(&client).await?;
        if replica.node_id == local.node_id {
            client.close();
            return Err(ClusterError::SelfReference("primarize"));
        }
        if replica.is_primary() {
            client.close();
            return Err(ClusterError::TargetIsPrimary(replica.node_id));
        }
        let client = self.clients.register(&replica.node_id, client);

        if local.is_standalone() {
            self.set_role(NodeRole::Primary).await;
            let me = self.local_info().await;
            self.cluster_map.write().await.add_primary(me);
            tracing::info!("Node {} is now a primary", local.node_id);
        }
        let primary = self.local_info().await;

        replica.role = NodeRole::Replica;
        let epoch = {
            let mut map = self.cluster_map.write().await;
            if map.is_replica_of(&replica.node_id, &primary.node_id) {
                tracing::debug!("Node {} already replicates {}", replica.node_id, primary.node_id);
                return Ok(());
            }
            map.add_replica(&primary, replica.clone());
            map.increment_epoch()
        };
        self.set_epoch(epoch).await;
        tracing::info!("Attached replica {} at epoch {}", replica, epoch);

        let replicate = Command::Node(NodeCommand::Replicate(primary.address.clone()));
        let request = RpcRequest::new(replicate).with_cluster_epoch(epoch);
        let response = client.call(request).await?;
        expect_ok(&replica.node_id, &response)?;

        let primary = self.local_info().await;
        if !self.replication.replicate_data_to(&primary, &replica).await {
            tracing::warn!("Replica {} attached but its bootstrap failed", replica.node_id);
        }
        Ok(())
    }

    /// Makes this node a replica of the node at `target`. `cluster_epoch` is
    /// the sender's epoch and acts as a floor when merging the target's map.
    pub async fn replicate(&self, target: &NodeAddress, cluster_epoch: u64) -> Result<()> {
        self.ensure_not_self(target, "replicate to").await?;

        let client = self.clients.connect(target).await?;
        let primary = fetch_node_info(&client).await?;
        let local = self.local_info().await;
        if primary.node_id == local.node_id {
            client.close();
            return Err(ClusterError::SelfReference("replicate to"));
        }
        if primary.is_replica() {
            client.close();
            return Err(ClusterError::TargetIsReplica(primary.node_id));
        }
        let client = self.clients.register(&primary.node_id, client);

        if local.is_replica()
            && self
                .cluster_map
                .read()
                .await
                .is_replica_of(&local.node_id, &primary.node_id)
        {
            tracing::debug!("Node {} already replicates {}", local.node_id, primary.node_id);
            return Ok(());
        }

        if local.is_primary() {
            self.repoint_replicas(&local, target, cluster_epoch).await;
            self.replication.clear_targets().await;
        }

        self.set_role(NodeRole::Replica).await;
        let me = self.local_info().await;
        let primary = primary.with_role(NodeRole::Primary);
        {
            let mut map = self.cluster_map.write().await;
            map.remove_primary(&me.node_id);
            map.add_replica(&primary, me.clone());
        }
        tracing::info!("Node {} is now a replica of {}", me.node_id, primary);

        self.replication
            .initiate_replication_of(&primary, &me.address)
            .await?;

        let response = client.send(Command::Info(InfoCommand::ClusterMap)).await?;
        expect_ok(&primary.node_id, &response)?;
        let mut remote: ClusterMap = serde_json::from_str(response.payload_str())?;
        remote.raise_epoch(cluster_epoch);

        let epoch = {
            let mut map = self.cluster_map.write().await;
            map.merge(remote);
            map.epoch()
        };
        self.set_epoch(epoch).await;
        Ok(())
    }

    /// Relays a client write from a replica to its primary and returns the
    /// primary's answer unchanged.
    pub async fn forward_to_primary(&self, request: &RpcRequest) -> Result<RpcResponse> {
        let local = self.local_info().await;
        let primary = self.own_primary(&local).await?;
        tracing::debug!("Forwarding {} to primary {}", request.command, primary.node_id);
        let client = self
            .clients
            .get_or_connect(&primary.node_id, &primary.address)
            .await?;
        Ok(client.call(request.relayed()).await?)
    }

    /// Sends entries owned by another node to that node as a client write.
    pub async fn forward_entries(&self, node_id: &str, entries: &[CacheEntry]) -> Result<()> {
        let owner = self
            .cluster_map
            .read()
            .await
            .node(node_id)
            .cloned()
            .ok_or_else(|| ClusterError::UnknownNode(node_id.to_string()))?;
        let client = self
            .clients
            .get_or_connect(&owner.node_id, &owner.address)
            .await?;
        client
            .put_all(
                entries,
                None,
                self.config.replication_batch_size,
                self.config.replication_max_retries,
            )
            .await?;
        Ok(())
    }

    async fn repoint_replicas(&self, local: &NodeInfo, target: &NodeAddress, cluster_epoch: u64) {
        let replicas = self.cluster_map.read().await.replicas_of(&local.node_id);
        for replica in replicas {
            tracing::info!("Re-pointing replica {} to {}", replica.node_id, target);
            let result = async {
                let client = self
                    .clients
                    .get_or_connect(&replica.node_id, &replica.address)
                    .await?;
                let request = RpcRequest::new(Command::Node(NodeCommand::Replicate(target.clone())))
                    .with_cluster_epoch(cluster_epoch);
                let response = client.call(request).await?;
                expect_ok(&replica.node_id, &response)
            }
            .await;
            if let Err(e) = result {
                tracing::warn!("Failed to re-point replica {}: {}", replica.node_id, e);
            }
        }
    }

    async fn ensure_not_self(&self, target: &NodeAddress, action: &'static str) -> Result<()> {
        let address = self.local.read().await.address.clone();
        if address.same_node(target).await? {
            return Err(ClusterError::SelfReference(action));
        }
        Ok(())
    }

    async fn own_primary(&self, local: &NodeInfo) -> Result<NodeInfo> {
        self.cluster_map
            .read()
            .await
            .primary_of(&local.node_id)
            .cloned()
            .ok_or_else(|| ClusterError::NoPrimary(local.node_id.clone()))
    }

    async fn set_role(&self, role: NodeRole) {
        let updated = {
            let mut local = self.local.write().await;
            local.role = role;
            local.touch();
            local.clone()
        };
        self.cluster_map.write().await.update_node(&updated);
    }

    async fn set_epoch(&self, epoch: u64) {
        let mut local = self.local.write().await;
        local.epoch = epoch;
        local.touch();
    }
}

async fn fetch_node_info(client: &PeerClient) -> Result<NodeInfo> {
    let response = client
        .send(Command::Info(InfoCommand::Node(NodeInfoKind::All)))
        .await?;
    expect_ok(&client.address().to_string(), &response)?;
    Ok(serde_json::from_str(response.payload_str())?)
}

fn expect_ok(node: &str, response: &RpcResponse) -> Result<()> {
    if response.is_ok() {
        return Ok(());
    }
    Err(ClusterError::Remote {
        node: node.to_string(),
        status: response.status,
        message: response.payload_str().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use network::{read_frame, write_frame};
    use storage::{BucketManager, Wal};
    use tokio::net::TcpListener;

    /// Peer that answers INFO NODE ALL with `info` and OK to anything else.
    async fn scripted_peer(info: NodeInfo) -> NodeAddress {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let info = info.clone();
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.into_split();
                    while let Ok(Some(request)) = read_frame::<_, RpcRequest>(&mut r).await {
                        let response = match request.command {
                            Command::Info(InfoCommand::Node(NodeInfoKind::All)) => {
                                RpcResponse::ok_with(serde_json::to_string(&info).unwrap())
                            }
                            _ => RpcResponse::ok(),
                        };
                        let response = response.with_correlation_id(request.correlation_id);
                        if write_frame(&mut w, &response).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        NodeAddress::new("127.0.0.1", port)
    }

    fn orchestrator(port: u16) -> ClusterOrchestrator {
        let local = NodeInfo::new("local", NodeAddress::new("127.0.0.1", port));
        let map = Arc::new(RwLock::new(ClusterMap::new(0)));
        let clients = Arc::new(ClientManager::new(&network::Config::default()));
        let replication = Arc::new(ReplicationManager::new(
            Config::default(),
            Arc::new(BucketManager::new("local", 4)),
            clients.clone(),
            map.clone(),
            Arc::new(Wal::new()),
        ));
        ClusterOrchestrator::new(Config::default(), local, map, clients, replication)
    }

    #[tokio::test]
    async fn cannot_target_self() {
        let node = orchestrator(7311);
        let me = NodeAddress::new("localhost", 7311);

        assert!(matches!(
            node.primarize(&me).await,
            Err(ClusterError::SelfReference(_))
        ));
        assert!(matches!(
            node.replicate(&me, 0).await,
            Err(ClusterError::SelfReference(_))
        ));
        assert_eq!(node.role().await, NodeRole::Standalone);
    }

    #[tokio::test]
    async fn primarizing_a_primary_is_rejected_without_side_effects() {
        let other =
            NodeInfo::new("other", NodeAddress::new("127.0.0.1", 1)).with_role(NodeRole::Primary);
        let address = scripted_peer(other).await;
        let node = orchestrator(7312);

        assert!(matches!(
            node.primarize(&address).await,
            Err(ClusterError::TargetIsPrimary(id)) if id == "other"
        ));
        assert_eq!(node.role().await, NodeRole::Standalone);
        assert_eq!(node.cluster_map().await, ClusterMap::new(0));
    }

    #[tokio::test]
    async fn replicating_a_replica_is_rejected_without_side_effects() {
        let other =
            NodeInfo::new("other", NodeAddress::new("127.0.0.1", 1)).with_role(NodeRole::Replica);
        let address = scripted_peer(other).await;
        let node = orchestrator(7313);

        assert!(matches!(
            node.replicate(&address, 3).await,
            Err(ClusterError::TargetIsReplica(id)) if id == "other"
        ));
        assert_eq!(node.role().await, NodeRole::Standalone);
        assert_eq!(node.cluster_map().await.epoch(), 0);
    }

    #[tokio::test]
    async fn standalone_node_has_no_primary_to_forward_to() {
        let node = orchestrator(7314);
        let request = RpcRequest::parse("PUT a 1").unwrap();
        assert!(matches!(
            node.forward_to_primary(&request).await,
            Err(ClusterError::NoPrimary(_))
        ));
    }

    #[tokio::test]
    async fn primarize_attaches_a_standalone_target() {
        let other = NodeInfo::new("other", NodeAddress::new("127.0.0.1", 1));
        let address = scripted_peer(other).await;
        let node = orchestrator(7315);

        node.primarize(&address).await.unwrap();

        assert_eq!(node.role().await, NodeRole::Primary);
        let map = node.cluster_map().await;
        assert_eq!(map.epoch(), 1);
        assert!(map.is_primary("local"));
        assert!(map.is_replica_of("other", "local"));
        assert_eq!(node.local_info().await.epoch, 1);

        // a second attach of the same node is a no-op
        node.primarize(&address).await.unwrap();
        assert_eq!(node.cluster_map().await.epoch(), 1);
    }
}
