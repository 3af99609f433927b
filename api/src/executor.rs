use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use network::{Operation, RequestHandler, RpcRequest, RpcResponse};

use crate::handlers::{
    AppState, DeleteHandler, GetHandler, InfoHandler, NodeHandler, PutHandler, UnknownHandler,
};

/// One implementation per operation tag.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn execute(&self, request: &RpcRequest) -> RpcResponse;
}

/// Dispatch table from operation to handler.
pub struct CommandExecutor {
    state: Arc<AppState>,
    handlers: HashMap<Operation, Arc<dyn CommandHandler>>,
    fallback: Arc<dyn CommandHandler>,
}

impl CommandExecutor {
    pub fn new(state: Arc<AppState>) -> Self {
        let mut handlers: HashMap<Operation, Arc<dyn CommandHandler>> = HashMap::new();
        handlers.insert(Operation::Put, Arc::new(PutHandler::new(state.clone())));
        handlers.insert(Operation::Get, Arc::new(GetHandler::new(state.clone())));
        handlers.insert(Operation::Delete, Arc::new(DeleteHandler::new(state.clone())));
        handlers.insert(Operation::Node, Arc::new(NodeHandler::new(state.clone())));
        handlers.insert(Operation::Info, Arc::new(InfoHandler::new(state.clone())));

        Self {
            state,
            handlers,
            fallback: Arc::new(UnknownHandler),
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub async fn execute(&self, request: RpcRequest) -> RpcResponse {
        self.state.qps.increment();
        let handler = self
            .handlers
            .get(&request.operation)
            .unwrap_or(&self.fallback);
        handler
            .execute(&request)
            .await
            .with_correlation_id(request.correlation_id.clone())
    }

    /// Parses and runs a text command, as typed by a user.
    pub async fn execute_text(&self, text: &str) -> RpcResponse {
        match RpcRequest::parse(text) {
            Ok(request) => self.execute(request).await,
            Err(e) => {
                self.state.qps.increment();
                e.into()
            }
        }
    }
}

#[async_trait]
impl RequestHandler for CommandExecutor {
    async fn handle(&self, request: RpcRequest) -> RpcResponse {
        self.execute(request).await
    }
}
