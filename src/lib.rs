pub mod config;
pub mod error;
pub mod node;

pub use config::Config;
pub use error::{O3CacheError, Result};
pub use node::Node;

// Re-export key types from workspace crates
pub use api;
pub use cluster;
pub use network;
pub use storage;
