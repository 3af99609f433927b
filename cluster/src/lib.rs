mod map;
mod node;
mod orchestrator;
mod replication;

pub use map::ClusterMap;
pub use node::{NodeInfo, NodeRole, NodeStatus};
pub use orchestrator::ClusterOrchestrator;
pub use replication::ReplicationManager;

use network::{NetworkError, RpcStatus};
use serde::{Deserialize, Serialize};
use storage::StorageError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub replication_batch_size: usize,
    pub replication_max_retries: usize,
    pub max_concurrent_replication: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            replication_batch_size: 50,
            replication_max_retries: 3,
            max_concurrent_replication: 64,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The target address resolves to this node.
    #[error("Cannot {0} self")]
    SelfReference(&'static str),

    /// The target already leads its own replicas and cannot be subordinated.
    #[error("Node {0} is already a primary")]
    TargetIsPrimary(String),

    #[error("Node {0} is a replica and cannot act as a primary")]
    TargetIsReplica(String),

    #[error("No primary known for node {0}")]
    NoPrimary(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// A peer answered with a non-OK status.
    #[error("Node {node} answered {status}: {message}")]
    Remote {
        node: String,
        status: RpcStatus,
        message: String,
    },

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
