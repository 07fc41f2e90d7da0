//! Shared API state and error responses
//!
//! Every error leaves the API as `{"error": {"code", "message", "details"}}`
//! with the status derived from its code.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::SessionStore;
use crate::context::RequestContext;
use crate::db::repositories::UserRepository;
use crate::services::identity::{ErrorKind, IdentityError, IdentityService};

/// Application state containing shared services
#[derive(Clone)]
pub struct AppState {
    pub identity: Arc<IdentityService>,
    pub users: Arc<dyn UserRepository>,
    pub sessions: Arc<SessionStore>,
    pub request_timeout: Duration,
}

impl AppState {
    /// A fresh context bounded by the configured request timeout
    pub fn request_context(&self) -> RequestContext {
        RequestContext::with_timeout(self.request_timeout)
    }
}

/// Error response for API errors
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ApiErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error: ApiErrorDetail {
                code: code.into(),
                message: message.into(),
                details: Some(details),
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("UNAUTHORIZED", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("NOT_FOUND", message)
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::new("VALIDATION_ERROR", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("CONFLICT", message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new("SERVICE_UNAVAILABLE", message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new("INTERNAL_ERROR", message)
    }

    fn status(&self) -> StatusCode {
        match self.error.code.as_str() {
            "VALIDATION_ERROR" => StatusCode::BAD_REQUEST,
            "UNAUTHORIZED" | "MALFORMED_TOKEN" | "INVALID_SIGNATURE" | "INVALID_CLAIM" => {
                StatusCode::UNAUTHORIZED
            }
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "REQUEST_CANCELLED" => StatusCode::REQUEST_TIMEOUT,
            "CONFLICT" => StatusCode::CONFLICT,
            "SERVICE_UNAVAILABLE" => StatusCode::SERVICE_UNAVAILABLE,
            "TIMEOUT" => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

impl From<IdentityError> for ApiError {
    fn from(e: IdentityError) -> Self {
        match e.kind() {
            ErrorKind::Validation => ApiError::validation_error(e.to_string()),
            ErrorKind::Unauthorized => ApiError::unauthorized(e.to_string()),
            ErrorKind::MalformedToken => ApiError::new("MALFORMED_TOKEN", e.to_string()),
            ErrorKind::InvalidSignature => ApiError::new("INVALID_SIGNATURE", e.to_string()),
            ErrorKind::InvalidClaim => ApiError::new("INVALID_CLAIM", e.to_string()),
            ErrorKind::NotFound => ApiError::not_found(e.to_string()),
            ErrorKind::Conflict => ApiError::conflict(e.to_string()),
            ErrorKind::Cancelled => ApiError::new("REQUEST_CANCELLED", e.to_string()),
            ErrorKind::Timeout => ApiError::new("TIMEOUT", e.to_string()),
            ErrorKind::ExhaustedRetries => match &e {
                IdentityError::ExhaustedRetries { attempts } => ApiError::with_details(
                    "SERVICE_UNAVAILABLE",
                    e.to_string(),
                    serde_json::json!({ "attempts": attempts }),
                ),
                _ => ApiError::service_unavailable(e.to_string()),
            },
            ErrorKind::Internal => {
                tracing::error!(error = ?e, "Identity operation failed");
                ApiError::internal_error("Internal server error")
            }
        }
    }
}
