use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use network::RpcStatus;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::executor::CommandExecutor;
use crate::{ApiError, ApiResult};

/// HTTP gateway: accepts the same text commands as the RPC port.
pub struct Server {
    config: crate::Config,
    executor: Arc<CommandExecutor>,
}

impl Server {
    pub fn new(config: crate::Config, executor: Arc<CommandExecutor>) -> Self {
        Self { config, executor }
    }

    pub async fn start(&self) -> ApiResult<()> {
        let app = self.create_router();

        let addr = self.config.bind_address();
        tracing::info!("Starting HTTP gateway on {}", addr);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ApiError::InternalError(format!("Failed to bind to {}: {}", addr, e)))?;

        axum::serve(listener, app)
            .await
            .map_err(|e| ApiError::InternalError(format!("Server error: {}", e)))?;

        Ok(())
    }

    pub fn create_router(&self) -> Router {
        Router::new()
            .route("/command", post(run_command))
            .route("/health", get(health_check))
            .with_state(self.executor.clone())
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
            .fallback(not_found)
    }
}

fn http_status(status: RpcStatus) -> StatusCode {
    match status {
        RpcStatus::Ok | RpcStatus::PartialFulfillment => StatusCode::OK,
        RpcStatus::NotFound => StatusCode::NOT_FOUND,
        RpcStatus::BadRequest => StatusCode::BAD_REQUEST,
        RpcStatus::UnsupportedOperation => StatusCode::NOT_IMPLEMENTED,
        RpcStatus::Error => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn run_command(
    State(executor): State<Arc<CommandExecutor>>,
    body: String,
) -> ApiResult<Response> {
    let text = body.trim();
    if text.is_empty() {
        return Err(ApiError::InvalidRequest("empty command".to_string()));
    }

    let response = executor.execute_text(text).await;
    let body = Json(serde_json::json!({
        "status": response.status,
        "response": response.payload,
    }));
    Ok((http_status(response.status), body).into_response())
}

async fn health_check(State(executor): State<Arc<CommandExecutor>>) -> Json<serde_json::Value> {
    let orchestrator = &executor.state().orchestrator;
    let local = orchestrator.local_info().await;
    let in_sync = orchestrator.replication().in_sync_replicas().await;
    Json(serde_json::json!({
        "status": "healthy",
        "node_id": local.node_id,
        "role": local.role,
        "epoch": local.epoch,
        "in_sync_replicas": in_sync,
    }))
}

async fn not_found() -> ApiResult<Response> {
    Err(ApiError::NotFound("Not found".to_string()))
}
