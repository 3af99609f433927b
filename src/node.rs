use crate::config::Config;
use crate::error::{O3CacheError, Result};
use api::{AppState, CommandExecutor, Qps};
use cluster::{ClusterMap, ClusterOrchestrator, NodeInfo, ReplicationManager};
use network::{ClientManager, NodeAddress, RequestHandler};
use std::sync::Arc;
use storage::{BucketManager, Wal};
use tokio::sync::RwLock;
use tracing::{error, info};

/// Composition root: wires storage, cluster and network layers into one
/// process. Construction binds the RPC port; `start` runs the services.
pub struct Node {
    local: NodeInfo,
    rpc: network::Server,
    gateway: Option<api::Server>,
    executor: Arc<CommandExecutor>,
    clients: Arc<ClientManager>,
    qps: Arc<Qps>,
}

impl Node {
    pub async fn new(config: Config) -> Result<Self> {
        if config.number_of_buckets == 0 {
            return Err(O3CacheError::InvalidConfig(
                "number_of_buckets must be positive".to_string(),
            ));
        }

        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let network_config: network::Config = config.clone().into();
        let rpc = network::Server::bind(&network_config).await?;
        // advertise the bound port, which differs from the configured one when it is 0
        let address = NodeAddress::new(config.host.clone(), rpc.local_addr()?.port());
        let local = NodeInfo::new(node_id.clone(), address);
        info!("Initializing o3cache node {} at {}", node_id, local.address);

        let buckets = Arc::new(BucketManager::new(node_id, config.number_of_buckets));
        let wal = Arc::new(Wal::new());
        let clients = Arc::new(ClientManager::new(&network_config));
        let cluster_map = Arc::new(RwLock::new(ClusterMap::new(0)));

        let cluster_config: cluster::Config = config.clone().into();
        let replication = Arc::new(ReplicationManager::new(
            cluster_config.clone(),
            buckets.clone(),
            clients.clone(),
            cluster_map.clone(),
            wal.clone(),
        ));
        let orchestrator = Arc::new(ClusterOrchestrator::new(
            cluster_config,
            local.clone(),
            cluster_map,
            clients.clone(),
            replication,
        ));

        let qps = Arc::new(Qps::new());
        let executor = Arc::new(CommandExecutor::new(Arc::new(AppState {
            buckets,
            wal,
            orchestrator,
            qps: qps.clone(),
        })));

        let gateway = Option::<api::Config>::from(config)
            .map(|api_config| api::Server::new(api_config, executor.clone()));

        Ok(Self {
            local,
            rpc,
            gateway,
            executor,
            clients,
            qps,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.local.node_id
    }

    /// The address peers should use, with the actual bound port.
    pub fn address(&self) -> &NodeAddress {
        &self.local.address
    }

    pub fn executor(&self) -> &Arc<CommandExecutor> {
        &self.executor
    }

    pub async fn start(self) -> Result<()> {
        info!("Starting o3cache node {} services", self.local.node_id);

        let rpc_task = {
            let handler: Arc<dyn RequestHandler> = self.executor.clone();
            let rpc = self.rpc;
            tokio::spawn(async move { rpc.serve(handler).await })
        };

        let qps_task = {
            let qps = self.qps.clone();
            tokio::spawn(async move { qps.run().await })
        };

        let gateway_task = {
            let gateway = self.gateway;
            tokio::spawn(async move {
                match gateway {
                    Some(gateway) => gateway.start().await,
                    None => std::future::pending().await,
                }
            })
        };

        let result: Result<()> = tokio::select! {
            result = rpc_task => {
                error!("RPC server stopped: {:?}", result);
                match result {
                    Ok(Err(e)) => Err(e.into()),
                    _ => Err(O3CacheError::Stopped("RPC server".to_string())),
                }
            }
            result = gateway_task => {
                error!("HTTP gateway stopped: {:?}", result);
                match result {
                    Ok(Err(e)) => Err(e.into()),
                    _ => Err(O3CacheError::Stopped("HTTP gateway".to_string())),
                }
            }
            result = qps_task => {
                error!("QPS ticker stopped: {:?}", result);
                Err(O3CacheError::Stopped("QPS ticker".to_string()))
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                Ok(())
            }
        };

        self.clients.close_all();
        result
    }
}
