use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::command::{Command, ParseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Put,
    Get,
    Delete,
    Node,
    Info,
    Unknown,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Put => "PUT",
            Operation::Get => "GET",
            Operation::Delete => "DELETE",
            Operation::Node => "NODE",
            Operation::Info => "INFO",
            Operation::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcStatus {
    Ok,
    PartialFulfillment,
    NotFound,
    BadRequest,
    UnsupportedOperation,
    Error,
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RpcStatus::Ok => "OK",
            RpcStatus::PartialFulfillment => "PARTIAL_FULFILLMENT",
            RpcStatus::NotFound => "NOT_FOUND",
            RpcStatus::BadRequest => "BAD_REQUEST",
            RpcStatus::UnsupportedOperation => "UNSUPPORTED_OPERATION",
            RpcStatus::Error => "ERROR",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub operation: Operation,
    pub command: Command,
    /// Set only on writes replicated from a primary.
    pub node_version: Option<u64>,
    pub cluster_epoch: u64,
    pub correlation_id: String,
}

impl RpcRequest {
    pub fn new(command: Command) -> Self {
        Self {
            operation: command.operation(),
            command,
            node_version: None,
            cluster_epoch: 0,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn parse(input: &str) -> std::result::Result<Self, ParseError> {
        Ok(Self::new(Command::parse(input)?))
    }

    pub fn with_node_version(mut self, node_version: u64) -> Self {
        self.node_version = Some(node_version);
        self
    }

    pub fn with_cluster_epoch(mut self, cluster_epoch: u64) -> Self {
        self.cluster_epoch = cluster_epoch;
        self
    }

    /// Same command under a fresh correlation id, used when relaying a
    /// request over another connection.
    pub fn relayed(&self) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            ..self.clone()
        }
    }

    pub fn is_replicated(&self) -> bool {
        self.node_version.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub status: RpcStatus,
    pub correlation_id: String,
    pub payload: Option<String>,
}

impl RpcResponse {
    pub fn new(status: RpcStatus, payload: Option<String>) -> Self {
        Self {
            status,
            correlation_id: String::new(),
            payload,
        }
    }

    pub fn ok() -> Self {
        Self::new(RpcStatus::Ok, None)
    }

    pub fn ok_with(payload: impl Into<String>) -> Self {
        Self::new(RpcStatus::Ok, Some(payload.into()))
    }

    pub fn partial(payload: impl Into<String>) -> Self {
        Self::new(RpcStatus::PartialFulfillment, Some(payload.into()))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RpcStatus::NotFound, Some(message.into()))
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(RpcStatus::BadRequest, Some(message.into()))
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(RpcStatus::UnsupportedOperation, Some(message.into()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(RpcStatus::Error, Some(message.into()))
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == RpcStatus::Ok
    }

    pub fn payload_str(&self) -> &str {
        self.payload.as_deref().unwrap_or_default()
    }
}

impl From<ParseError> for RpcResponse {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::Malformed(message) => RpcResponse::bad_request(message),
            ParseError::Unsupported(message) => RpcResponse::unsupported(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_get_unique_correlation_ids() {
        let a = RpcRequest::parse("GET a").unwrap();
        let b = RpcRequest::parse("GET a").unwrap();
        assert_ne!(a.correlation_id, b.correlation_id);
        assert_eq!(a.operation, Operation::Get);
        assert!(!a.is_replicated());

        let relayed = a.relayed();
        assert_eq!(relayed.command, a.command);
        assert_ne!(relayed.correlation_id, a.correlation_id);
    }

    #[test]
    fn parse_errors_map_to_statuses() {
        let malformed: RpcResponse = RpcRequest::parse("PUT a").unwrap_err().into();
        assert_eq!(malformed.status, RpcStatus::BadRequest);

        let unsupported: RpcResponse = RpcRequest::parse("NODE DEMOTE x@1").unwrap_err().into();
        assert_eq!(unsupported.status, RpcStatus::UnsupportedOperation);
    }

    #[test]
    fn status_names() {
        assert_eq!(RpcStatus::PartialFulfillment.to_string(), "PARTIAL_FULFILLMENT");
        assert_eq!(
            serde_json::to_string(&RpcStatus::NotFound).unwrap(),
            "\"NOT_FOUND\""
        );
    }
}
