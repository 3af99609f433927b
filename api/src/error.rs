use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use network::RpcStatus;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, status, message) = match self {
            ApiError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, RpcStatus::BadRequest, msg)
            }
            ApiError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, RpcStatus::UnsupportedOperation, msg)
            }
            ApiError::InternalError(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, RpcStatus::Error, msg)
            }
        };

        (
            code,
            Json(serde_json::json!({
                "status": status,
                "response": message,
            })),
        )
            .into_response()
    }
}
