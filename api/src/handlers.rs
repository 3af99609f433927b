use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use cluster::{ClusterOrchestrator, NodeInfo, NodeRole};
use network::{Command, InfoCommand, NodeCommand, NodeInfoKind, RpcRequest, RpcResponse};
use storage::{now_ms, BucketManager, CacheEntry, StorageError, Wal};

use crate::executor::CommandHandler;
use crate::qps::Qps;

pub struct AppState {
    pub buckets: Arc<BucketManager>,
    pub wal: Arc<Wal>,
    pub orchestrator: Arc<ClusterOrchestrator>,
    pub qps: Arc<Qps>,
}

impl AppState {
    /// Replicas never originate versions: a write without a node version
    /// arriving at a replica belongs to its primary.
    fn must_forward(local: &NodeInfo, request: &RpcRequest) -> bool {
        local.is_replica() && !request.is_replicated()
    }

    async fn forward(&self, request: &RpcRequest) -> RpcResponse {
        match self.orchestrator.forward_to_primary(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Failed to forward {} to primary: {}", request.command, e);
                RpcResponse::error(e.to_string())
            }
        }
    }

    /// Applies entries locally, logs the write and fans it out to replicas.
    async fn commit_put(
        &self,
        local: &NodeInfo,
        entries: Vec<CacheEntry>,
        replicated: bool,
    ) -> Result<(), StorageError> {
        if let [entry] = entries.as_slice() {
            self.buckets.put(entry.clone()).await?;
        } else {
            self.buckets.put_all(entries.clone()).await?;
        }
        if replicated {
            return Ok(());
        }

        let version = self.wal.append(command_bytes(&Command::put_entries(&entries)));
        if local.is_primary() {
            let replication = self.orchestrator.replication();
            replication.clear_in_sync().await;
            replication
                .replicate_put(&local.node_id, entries, version)
                .await;
        }
        Ok(())
    }

    async fn commit_delete(
        &self,
        local: &NodeInfo,
        keys: &[String],
        replicated: bool,
    ) -> Result<(), StorageError> {
        for key in keys {
            self.buckets.delete(key).await?;
        }
        if replicated {
            return Ok(());
        }

        let version = self.wal.append(command_bytes(&Command::Delete(keys.to_vec())));
        if local.is_primary() {
            let replication = self.orchestrator.replication();
            replication.clear_in_sync().await;
            replication
                .replicate_delete(&local.node_id, keys.to_vec(), version)
                .await;
        }
        Ok(())
    }
}

/// WAL payload for a command: its canonical text form.
fn command_bytes(command: &Command) -> Bytes {
    Bytes::from(command.to_string())
}

pub struct PutHandler {
    state: Arc<AppState>,
}

impl PutHandler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Writes a batch whose keys live on several nodes: local keys are
    /// committed here, the rest are sent to their owners.
    async fn split_put(
        &self,
        local: &NodeInfo,
        mut entries: HashMap<String, CacheEntry>,
        groups: HashMap<String, Vec<String>>,
    ) -> RpcResponse {
        let total = groups.len();
        let mut failed = Vec::new();

        for (node_id, keys) in groups {
            let batch: Vec<CacheEntry> = keys.iter().filter_map(|k| entries.remove(k)).collect();
            let result = if node_id == local.node_id {
                self.state
                    .commit_put(local, batch, false)
                    .await
                    .map_err(|e| e.to_string())
            } else {
                self.state
                    .orchestrator
                    .forward_entries(&node_id, &batch)
                    .await
                    .map_err(|e| e.to_string())
            };
            if let Err(e) = result {
                tracing::warn!("PUT to node {} failed: {}", node_id, e);
                failed.push(node_id);
            }
        }

        match failed.len() {
            0 => RpcResponse::ok(),
            n if n == total => RpcResponse::error(format!("PUT failed on nodes {:?}", failed)),
            _ => RpcResponse::partial(format!("PUT failed on nodes {:?}", failed)),
        }
    }
}

#[async_trait]
impl CommandHandler for PutHandler {
    async fn execute(&self, request: &RpcRequest) -> RpcResponse {
        let Command::Put(puts) = &request.command else {
            return RpcResponse::bad_request("expected a PUT command");
        };

        let local = self.state.orchestrator.local_info().await;
        if AppState::must_forward(&local, request) {
            return self.state.forward(request).await;
        }

        let now = now_ms();
        let entries: Vec<CacheEntry> = puts.iter().map(|p| p.to_cache_entry(now)).collect();

        if local.is_primary() && !request.is_replicated() {
            let keys: Vec<String> = entries.iter().map(|e| e.key.clone()).collect();
            match self.state.buckets.key_to_node_map(&keys).await {
                Ok(groups) if groups.len() > 1 || !groups.contains_key(&local.node_id) => {
                    let by_key = entries.into_iter().map(|e| (e.key.clone(), e)).collect();
                    return self.split_put(&local, by_key, groups).await;
                }
                Ok(_) => {}
                Err(e) => return RpcResponse::error(e.to_string()),
            }
        }

        match self
            .state
            .commit_put(&local, entries, request.is_replicated())
            .await
        {
            Ok(()) => RpcResponse::ok(),
            Err(e) => {
                tracing::warn!("PUT failed: {}", e);
                RpcResponse::error(e.to_string())
            }
        }
    }
}

pub struct GetHandler {
    state: Arc<AppState>,
}

impl GetHandler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl CommandHandler for GetHandler {
    async fn execute(&self, request: &RpcRequest) -> RpcResponse {
        let Command::Get(keys) = &request.command else {
            return RpcResponse::bad_request("expected a GET command");
        };

        if let [key] = keys.as_slice() {
            return match self.state.buckets.get(key).await {
                Ok(Some(entry)) => RpcResponse::ok_with(entry.value_string()),
                Ok(None) => RpcResponse::not_found(format!("Key '{}' not found", key)),
                Err(e) => RpcResponse::error(e.to_string()),
            };
        }

        let mut values: Vec<Option<String>> = Vec::with_capacity(keys.len());
        for key in keys {
            match self.state.buckets.get(key).await {
                Ok(entry) => values.push(entry.map(|e| e.value_string())),
                Err(e) => return RpcResponse::error(e.to_string()),
            }
        }

        let payload = match serde_json::to_string(&values) {
            Ok(json) => json,
            Err(e) => return RpcResponse::error(e.to_string()),
        };
        if values.iter().any(Option::is_none) {
            RpcResponse::partial(payload)
        } else {
            RpcResponse::ok_with(payload)
        }
    }
}

pub struct DeleteHandler {
    state: Arc<AppState>,
}

impl DeleteHandler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl CommandHandler for DeleteHandler {
    async fn execute(&self, request: &RpcRequest) -> RpcResponse {
        let Command::Delete(keys) = &request.command else {
            return RpcResponse::bad_request("expected a DELETE command");
        };

        let local = self.state.orchestrator.local_info().await;
        if AppState::must_forward(&local, request) {
            return self.state.forward(request).await;
        }

        match self
            .state
            .commit_delete(&local, keys, request.is_replicated())
            .await
        {
            Ok(()) => RpcResponse::ok(),
            Err(e) => RpcResponse::error(e.to_string()),
        }
    }
}

pub struct NodeHandler {
    state: Arc<AppState>,
}

impl NodeHandler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl CommandHandler for NodeHandler {
    async fn execute(&self, request: &RpcRequest) -> RpcResponse {
        let orchestrator = &self.state.orchestrator;
        match &request.command {
            Command::Node(NodeCommand::Primarize(targets)) => {
                let mut failures = Vec::new();
                for target in targets {
                    if let Err(e) = orchestrator.primarize(target).await {
                        tracing::error!("Failed to primarize {}: {}", target, e);
                        failures.push(format!("{}: {}", target, e));
                    }
                }
                match failures.len() {
                    0 => RpcResponse::ok(),
                    n if n == targets.len() => RpcResponse::error(failures.join("; ")),
                    _ => RpcResponse::partial(failures.join("; ")),
                }
            }
            Command::Node(NodeCommand::Replicate(target)) => {
                match orchestrator.replicate(target, request.cluster_epoch).await {
                    Ok(()) => RpcResponse::ok(),
                    Err(e) => {
                        tracing::error!("Failed to replicate {}: {}", target, e);
                        RpcResponse::error(e.to_string())
                    }
                }
            }
            _ => RpcResponse::bad_request("expected a NODE command"),
        }
    }
}

pub struct InfoHandler {
    state: Arc<AppState>,
}

impl InfoHandler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl CommandHandler for InfoHandler {
    async fn execute(&self, request: &RpcRequest) -> RpcResponse {
        let Command::Info(info) = &request.command else {
            return RpcResponse::bad_request("expected an INFO command");
        };

        let payload = match info {
            InfoCommand::Node(NodeInfoKind::Id) => {
                Ok(self.state.orchestrator.local_info().await.node_id)
            }
            InfoCommand::Node(NodeInfoKind::All) => {
                serde_json::to_string(&self.state.orchestrator.local_info().await)
            }
            InfoCommand::Node(NodeInfoKind::MaxQps) => Ok(self.state.qps.max().to_string()),
            InfoCommand::Node(NodeInfoKind::CurrentQps) => {
                Ok(self.state.qps.current().to_string())
            }
            InfoCommand::BucketMap => {
                serde_json::to_string(&self.state.buckets.all_buckets().await)
            }
            InfoCommand::ClusterMap => {
                if self.state.orchestrator.role().await == NodeRole::Standalone {
                    return RpcResponse::unsupported("Node is standalone");
                }
                serde_json::to_string(&self.state.orchestrator.cluster_map().await)
            }
        };

        match payload {
            Ok(payload) => RpcResponse::ok_with(payload),
            Err(e) => RpcResponse::error(e.to_string()),
        }
    }
}

pub struct UnknownHandler;

#[async_trait]
impl CommandHandler for UnknownHandler {
    async fn execute(&self, request: &RpcRequest) -> RpcResponse {
        RpcResponse::unsupported(format!("Unsupported operation '{}'", request.command))
    }
}
