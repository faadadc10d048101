//! Inbound bearer authentication.
//!
//! When an `AUTH_KEY` is configured every proxied request, and `POST /select`,
//! must carry `Authorization: Bearer <AUTH_KEY>`. The scheme is matched
//! case-insensitively, the token exactly.

use axum::http::{header, HeaderMap};

use crate::core::config::RequestConfig;
use crate::core::error::Result;
use crate::core::AppError;

// ============================================================================
// Helper Functions
// ============================================================================

/// Extract the Bearer token from the Authorization header, trimmed.
pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

// ============================================================================
// Main Authentication Function
// ============================================================================

/// Check the inbound credential against the configured key.
///
/// Always succeeds when authentication is disabled.
pub fn verify_auth(headers: &HeaderMap, settings: &RequestConfig) -> Result<()> {
    if !settings.auth_enabled() {
        return Ok(());
    }

    let provided = extract_bearer(headers)
        .ok_or_else(|| AppError::Unauthorized("missing bearer token".to_string()))?;

    if provided != settings.auth_key {
        tracing::warn!("Rejected request with invalid bearer token");
        return Err(AppError::Unauthorized("invalid bearer token".to_string()));
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
