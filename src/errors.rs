use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

pub const NOT_AUTHENTICATED: &str = "Not authenticated, authorization denied.";
pub const RATE_LIMIT_EXCEEDED: &str = "Too many requests, slow down!";

/// Failure kinds that abort an operation. Expected, user-correctable input
/// problems are never represented here; those travel as `FieldError` data.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{}", NOT_AUTHENTICATED)]
    NotAuthenticated,
    #[error("{0}")]
    RateLimitExceeded(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotAuthenticated => StatusCode::UNAUTHORIZED,
            AppError::RateLimitExceeded(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand to the caller.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Internal(_) => "Internal Server Error".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorEntry {
    pub message: String,
    pub status: u16,
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub data: Option<serde_json::Value>,
    pub errors: Vec<ErrorEntry>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let AppError::Internal(e) = &self {
            error!(error = ?e, "internal error");
        }
        let body = ErrorEnvelope {
            data: None,
            errors: vec![ErrorEntry {
                message: self.public_message(),
                status: status.as_u16(),
            }],
        };
        (status, Json(body)).into_response()
    }
}
