use chrono::{DateTime, Utc};
use network::NodeAddress;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRole {
    Standalone,
    Primary,
    Replica,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Standalone => f.write_str("STANDALONE"),
            NodeRole::Primary => f.write_str("PRIMARY"),
            NodeRole::Replica => f.write_str("REPLICA"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Alive,
    Suspect,
    Failed,
}

/// A cluster member: its identity (`node_id` + `address`) and the mutable
/// state this node knows about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub address: NodeAddress,
    pub role: NodeRole,
    pub epoch: u64,
    pub heartbeat_counter: u32,
    pub status: NodeStatus,
    pub last_update_time: DateTime<Utc>,
}

impl NodeInfo {
    pub fn new(node_id: impl Into<String>, address: NodeAddress) -> Self {
        Self {
            node_id: node_id.into(),
            address,
            role: NodeRole::Standalone,
            epoch: 0,
            heartbeat_counter: 0,
            status: NodeStatus::Alive,
            last_update_time: Utc::now(),
        }
    }

    pub fn with_role(mut self, role: NodeRole) -> Self {
        self.role = role;
        self
    }

    pub fn is_primary(&self) -> bool {
        self.role == NodeRole::Primary
    }

    pub fn is_replica(&self) -> bool {
        self.role == NodeRole::Replica
    }

    pub fn is_standalone(&self) -> bool {
        self.role == NodeRole::Standalone
    }

    pub fn touch(&mut self) {
        self.last_update_time = Utc::now();
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.node_id, self.address, self.role)
    }
}
