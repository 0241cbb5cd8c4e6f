//! API Error Handling
//!
//! Structured error responses with HTTP status codes and request tracking.

use crate::errors::CrashError;
use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error};

/// Top-level API error response with request tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub request_id: String,
    pub error: ErrorBody,
}

/// Error body with structured information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error code (INSUFFICIENT_BALANCE, ROUND_ALREADY_CRASHED, etc.)
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional additional details (can be any JSON)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API error types with request tracking
#[derive(Debug)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub request_id: String,
}

#[derive(Debug)]
pub enum ApiErrorKind {
    BadRequest(String),
    Unauthorized(String),
    Game(CrashError),
}

impl ApiError {
    pub fn bad_request(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::BadRequest(message),
            request_id,
        }
    }

    /// Body that is not valid JSON or does not fit the request type
    pub fn invalid_body(request_id: String, rejection: JsonRejection) -> Self {
        Self::bad_request(request_id, rejection.body_text())
    }

    pub fn unauthorized(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::Unauthorized(message),
            request_id,
        }
    }

    pub fn game(request_id: String, error: CrashError) -> Self {
        Self {
            kind: ApiErrorKind::Game(error),
            request_id,
        }
    }

    pub fn status(&self) -> StatusCode {
        match &self.kind {
            ApiErrorKind::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiErrorKind::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiErrorKind::Game(e) if e.is_expected() => StatusCode::BAD_REQUEST,
            ApiErrorKind::Game(CrashError::Scheduler(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorKind::Game(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ApiErrorKind::BadRequest(msg) => write!(f, "[{}] Bad Request: {}", self.request_id, msg),
            ApiErrorKind::Unauthorized(msg) => write!(f, "[{}] Unauthorized: {}", self.request_id, msg),
            ApiErrorKind::Game(e) => write!(f, "[{}] {}", self.request_id, e),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (code, message, details) = match &self.kind {
            ApiErrorKind::BadRequest(msg) => ("BAD_REQUEST", msg.clone(), None),
            ApiErrorKind::Unauthorized(msg) => ("UNAUTHORIZED", msg.clone(), None),
            ApiErrorKind::Game(e) => {
                if status.is_server_error() {
                    error!("[{}] Request failed: {}", self.request_id, e);
                } else {
                    debug!("[{}] Request rejected: {}", self.request_id, e);
                }
                (e.code(), e.to_string(), error_details(e))
            }
        };

        let body = Json(ErrorResponse {
            request_id: self.request_id.clone(),
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        });

        (status, body).into_response()
    }
}

fn error_details(error: &CrashError) -> Option<serde_json::Value> {
    match error {
        CrashError::InsufficientBalance { balance, required, .. } => Some(serde_json::json!({
            "balance": balance,
            "required": required,
        })),
        CrashError::Validation(crate::errors::ValidationError::InvalidAmount { min, max, .. }) => {
            Some(serde_json::json!({ "min": min, "max": max }))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::{RoundStateError, SchedulerError, StorageError},
        types::{RoundId, UserId},
    };

    fn status_of(error: CrashError) -> StatusCode {
        ApiError::game("req".to_string(), error).status()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_of(RoundStateError::AlreadyCrashed(RoundId(1)).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(CrashError::InsufficientBalance {
                user_id: UserId(1),
                balance: 0,
                required: 10
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_of(StorageError::Timeout(5).into()), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status_of(SchedulerError::Unavailable.into()), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ApiError::unauthorized("req".to_string(), "missing".to_string()).status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
