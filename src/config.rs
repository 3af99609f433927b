use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Generated when absent.
    pub node_id: Option<String>,
    /// Host peers use to reach this node.
    pub host: String,
    pub bind_ip: IpAddr,
    /// RPC port; 0 picks an ephemeral one.
    pub port: u16,
    /// HTTP gateway port. The gateway is off when unset.
    pub api_port: Option<u16>,
    pub number_of_buckets: usize,
    pub request_timeout_ms: u64,
    pub replication_batch_size: usize,
    pub replication_max_retries: usize,
    pub max_concurrent_requests: usize,
    pub max_concurrent_replication: usize,
}

impl Config {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_ip, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: None,
            host: "127.0.0.1".to_string(),
            bind_ip: IpAddr::from([127, 0, 0, 1]),
            port: 0,
            api_port: None,
            number_of_buckets: 16,
            request_timeout_ms: 5_000,
            replication_batch_size: 50,
            replication_max_retries: 3,
            max_concurrent_requests: 256,
            max_concurrent_replication: 64,
        }
    }
}

impl From<Config> for network::Config {
    fn from(config: Config) -> Self {
        network::Config {
            bind_ip: config.bind_ip,
            port: config.port,
            request_timeout_ms: config.request_timeout_ms,
            max_concurrent_requests: config.max_concurrent_requests,
        }
    }
}

impl From<Config> for cluster::Config {
    fn from(config: Config) -> Self {
        cluster::Config {
            replication_batch_size: config.replication_batch_size,
            replication_max_retries: config.replication_max_retries,
            max_concurrent_replication: config.max_concurrent_replication,
        }
    }
}

/// `None` when the gateway is disabled.
impl From<Config> for Option<api::Config> {
    fn from(config: Config) -> Self {
        config.api_port.map(|port| api::Config {
            bind_ip: config.bind_ip,
            port,
        })
    }
}
