mod error;
mod executor;
mod handlers;
mod qps;
mod server;

pub use error::{ApiError, ApiResult};
pub use executor::{CommandExecutor, CommandHandler};
pub use handlers::AppState;
pub use qps::Qps;
pub use server::Server;

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// HTTP gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bind_ip: IpAddr,
    pub port: u16,
}

impl Config {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_ip, self.port)
    }
}
