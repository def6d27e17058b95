//! HTTP error responses: `{"error": {"code": ..., "message": ...}}`.

use agentrun_base::error::AgentRunError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    App(#[from] anyhow::Error),
}

impl AppError {
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_PARAMETER"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::App(e) => match AgentRunError::find_in(e) {
                Some(
                    AgentRunError::InvalidParameter(_)
                    | AgentRunError::ParseError(_)
                    | AgentRunError::CodecError(_),
                ) => (StatusCode::BAD_REQUEST, "INVALID_PARAMETER"),
                Some(AgentRunError::NotFound(_) | AgentRunError::AgentNotFound(_)) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND")
                }
                Some(AgentRunError::AlreadyExists(_)) => (StatusCode::CONFLICT, "ALREADY_EXISTS"),
                Some(AgentRunError::InvalidStatusTransition(_)) => {
                    (StatusCode::CONFLICT, "INVALID_STATUS_TRANSITION")
                }
                Some(AgentRunError::EnqueueError(_)) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "ENQUEUE_FAILED")
                }
                Some(AgentRunError::TimeoutError(_)) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let (_, code) = self.status_and_code();
        let message = match self {
            AppError::App(e) => match AgentRunError::find_in(e) {
                Some(AgentRunError::DBError(_) | AgentRunError::RedisError(_)) | None => {
                    // storage details stay in the log
                    "internal error".to_string()
                }
                Some(kind) => kind.to_string(),
            },
            other => other.to_string(),
        };
        serde_json::json!({"error": {"code": code, "message": message}})
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, _) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!("request failed: {:?}", &self);
        } else {
            tracing::debug!("request rejected: {}", &self);
        }
        (status, Json(self.to_json())).into_response()
    }
}
