use thiserror::Error;

#[derive(Error, Debug)]
pub enum O3CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] network::NetworkError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] cluster::ClusterError),

    #[error("API error: {0}")]
    Api(#[from] api::ApiError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Service stopped: {0}")]
    Stopped(String),
}

pub type Result<T> = std::result::Result<T, O3CacheError>;
