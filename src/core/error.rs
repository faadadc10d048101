//! Error types and handling for the router.
//!
//! This module provides a unified error type [`AppError`] that covers every
//! failure the HTTP boundary can report and implements the conversion into a
//! response. All bodies use the `{"detail": "..."}` shape, except the blocked
//! client response which is deliberately empty.

use crate::core::rate_limiter::BucketSnapshot;
use axum::{
    body::Body,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Non-standard status used for blocked clients ("connection closed without response").
pub const BLOCKED_CLIENT_STATUS: u16 = 444;

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// No usable endpoint, or an invalid limiter/provider setup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Missing or wrong bearer token on an inbound request.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Client supplied an unusable value (e.g. a non-integer `/select` body).
    #[error("Validation error: {0}")]
    Validation(String),

    /// The client's token bucket is empty.
    #[error("Rate limit exceeded")]
    RateLimitExceeded(BucketSnapshot),

    /// The client's address is on the static blocklist.
    #[error("Blocked client")]
    BlockedClient,

    /// Every attempt failed before a response could be committed.
    #[error("upstream request failed after {attempts} attempts: {last_error}")]
    UpstreamExhausted { attempts: u32, last_error: String },

    /// Upstream failure that no other endpoint can fix.
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// Generic internal server errors with custom message
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status this error is reported with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::BlockedClient => {
                StatusCode::from_u16(BLOCKED_CLIENT_STATUS).unwrap_or(StatusCode::FORBIDDEN)
            }
            AppError::UpstreamExhausted { .. } | AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message placed in the `detail` field.
    fn detail(&self) -> String {
        match self {
            AppError::Configuration(msg)
            | AppError::Unauthorized(msg)
            | AppError::Validation(msg)
            | AppError::Upstream(msg)
            | AppError::Internal(msg) => msg.clone(),
            AppError::RateLimitExceeded(snapshot) => format!(
                "Rate limit exceeded, retry in {} seconds",
                snapshot.retry_after_secs()
            ),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let detail = self.detail();

        match self {
            AppError::BlockedClient => {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = status;
                response
                    .headers_mut()
                    .insert(header::CONNECTION, HeaderValue::from_static("close"));
                response
            }
            AppError::RateLimitExceeded(snapshot) => {
                let mut response = (status, Json(json!({ "detail": detail }))).into_response();
                let headers = response.headers_mut();
                snapshot.apply_headers(headers);
                headers.insert(header::RETRY_AFTER, HeaderValue::from(snapshot.retry_after_secs()));
                response
            }
            other => {
                if status.is_server_error() {
                    tracing::debug!(status = status.as_u16(), error = %other, "Returning error response");
                }
                (status, Json(json!({ "detail": detail }))).into_response()
            }
        }
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;
