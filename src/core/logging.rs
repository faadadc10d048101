//! Request-id context for log and telemetry correlation.
//!
//! The request-context middleware runs each request inside a [`REQUEST_ID`]
//! scope. Code deeper in the pipeline (the retry loop, the stream relay, the
//! telemetry sink) reads it back with [`get_request_id`].

use axum::http::HeaderMap;

/// Inbound header a caller may use to supply its own id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest caller-supplied id that is adopted as is.
pub const MAX_REQUEST_ID_LEN: usize = 128;

tokio::task_local! {
    pub static REQUEST_ID: String;
}

/// Id of the request being served, or `""` outside a request scope.
pub fn get_request_id() -> String {
    REQUEST_ID.try_with(Clone::clone).unwrap_or_default()
}

/// Adopt the caller's `x-request-id` when it is usable, else mint a UUID v4.
pub fn request_id_for(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}
