//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::repository::StoreError;
use crate::service::JobError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    TooManyRequests(String),
    Conflict(String),
    BadGateway(String),
    StoreError(StoreError),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => {
                tracing::warn!("Upstream error: {}", msg);
                (StatusCode::BAD_GATEWAY, msg)
            }
            ApiError::StoreError(err) => {
                tracing::error!("Store error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound(id) => ApiError::NotFound(format!("Job {} not found", id)),
            JobError::Validation(_) | JobError::Policy(_) | JobError::Synthesis(_) => {
                ApiError::BadRequest(err.to_string())
            }
            JobError::QuotaExceeded { .. } | JobError::RateLimited { .. } => {
                ApiError::TooManyRequests(err.to_string())
            }
            JobError::Upload(_) | JobError::Provisioning(_) => ApiError::BadGateway(err.to_string()),
            JobError::Store(err) => ApiError::StoreError(err),
            JobError::Cancelled(_) => ApiError::Conflict(err.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
