mod codec;
mod command;
mod communication;
mod manager;
mod protocol;
mod server;

pub use codec::{read_frame, write_frame, MAX_FRAME_LEN};
pub use command::{Command, InfoCommand, NodeCommand, NodeInfoKind, ParseError, PutEntry};
pub use communication::PeerClient;
pub use manager::ClientManager;
pub use protocol::{Operation, RpcRequest, RpcResponse, RpcStatus};
pub use server::{RequestHandler, Server};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// Separator between host and port in textual node addresses (`host@port`).
pub const ADDRESS_DELIMITER: char = '@';

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .collect();
        if addrs.is_empty() {
            return Err(NetworkError::InvalidAddress(format!(
                "{} did not resolve to any address",
                self
            )));
        }
        Ok(addrs)
    }

    /// Two addresses name the same node when host and port match after DNS
    /// resolution (`localhost@7000` and `127.0.0.1@7000` are one node).
    pub async fn same_node(&self, other: &NodeAddress) -> Result<bool> {
        if self == other {
            return Ok(true);
        }
        if self.port != other.port {
            return Ok(false);
        }
        let mine = self.resolve().await?;
        let theirs = other.resolve().await?;
        Ok(mine.iter().any(|addr| theirs.contains(addr)))
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.host, ADDRESS_DELIMITER, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s.split_once(ADDRESS_DELIMITER).ok_or_else(|| {
            NetworkError::InvalidAddress(format!("expected host@port, got '{}'", s))
        })?;
        if host.is_empty() || port.contains(ADDRESS_DELIMITER) {
            return Err(NetworkError::InvalidAddress(format!(
                "expected host@port, got '{}'",
                s
            )));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| NetworkError::InvalidAddress(format!("invalid port in '{}'", s)))?;
        Ok(Self::new(host, port))
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection to {0} closed")]
    ConnectionClosed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("{failed} of {total} batches failed")]
    BatchFailed { failed: usize, total: usize },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_ip: IpAddr,
    pub port: u16,
    pub request_timeout_ms: u64,
    pub max_concurrent_requests: usize,
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::from([127, 0, 0, 1]),
            port: 0,
            request_timeout_ms: 5_000,
            max_concurrent_requests: 256,
        }
    }
}
