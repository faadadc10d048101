//! Upstream request construction and failure classification.
//!
//! Everything the retry loop needs to decide about one attempt lives here:
//! the target URL, the outbound request, whether a failure may be retried,
//! and how long to wait before the next try.

use axum::http::{header, HeaderMap, Method};
use bytes::Bytes;
use serde::Deserialize;
use std::time::Duration;

use crate::core::error::AppError;
use crate::core::header_policy::to_upstream_headers;

/// Upper bound on the backoff exponent.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Outcome class of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing reached the client; another endpoint may be tried.
    Retryable(String),
    /// Retrying cannot help.
    Terminal(String),
}

impl Disposition {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Disposition::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Disposition::Retryable(message) | Disposition::Terminal(message) => message,
        }
    }
}

/// `base_url + path + ?query`, with exactly one slash at the join.
pub fn build_upstream_url(base_url: &str, path: &str, query: Option<&str>) -> String {
    let base = base_url.trim_end_matches('/');
    let mut url = if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    };
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Whether requests with `method` carry a body upstream.
pub fn sends_body(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD | Method::DELETE)
}

/// Build one outbound attempt. `headers` must already be stripped.
pub fn build_upstream_request(
    client: &reqwest::Client,
    method: &Method,
    url: &str,
    headers: &HeaderMap,
    api_key: &str,
    body: Option<Bytes>,
) -> Result<reqwest::RequestBuilder, AppError> {
    let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|_| AppError::Validation(format!("unsupported method: {}", method)))?;

    let mut request = client
        .request(method, url)
        .headers(to_upstream_headers(headers))
        .bearer_auth(api_key);

    if let Some(body) = body {
        request = request.body(body);
    }

    Ok(request)
}

/// Classify a transport failure.
///
/// Messages never include the upstream URL so they are safe to return to the
/// client.
pub fn classify_transport_error(error: &reqwest::Error) -> Disposition {
    if error.is_builder() {
        return Disposition::Terminal("invalid upstream request".to_string());
    }
    if error.is_redirect() {
        return Disposition::Terminal("upstream redirect rejected".to_string());
    }

    let message = if error.is_timeout() {
        "upstream request timed out"
    } else if error.is_connect() {
        "failed to connect to upstream"
    } else if error.is_body() || error.is_decode() {
        "upstream body read failed"
    } else {
        "upstream request failed"
    };
    Disposition::Retryable(message.to_string())
}

/// Statuses worth another attempt on a different endpoint.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(
        status,
        408 | 409 | 425 | 429 | 500 | 502 | 503 | 504 | 520..=524
    )
}

/// Wait before attempt `failed_attempt + 1`: `base * 2^(failed_attempt - 1)`,
/// capped at `max`.
pub fn next_backoff(failed_attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = failed_attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
    let multiplier = 1_u64 << exponent;
    let millis = (base.as_millis() as u64)
        .saturating_mul(multiplier)
        .min(max.as_millis() as u64);
    Duration::from_millis(millis)
}

/// The one body field the router looks at; every other field is skipped
/// without being materialized.
#[derive(Deserialize)]
struct StreamFlag {
    stream: Option<bool>,
}

/// Whether the client asked for a streamed response.
///
/// True when `Accept` mentions `text/event-stream` or the body is a JSON
/// object with a top-level `"stream": true`.
pub fn wants_streaming(headers: &HeaderMap, body: &[u8]) -> bool {
    let accepts_sse = headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("text/event-stream"));
    if accepts_sse {
        return true;
    }

    let start = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(body.len());
    let trimmed = &body[start..];
    if !trimmed.starts_with(b"{") {
        return false;
    }
    serde_json::from_slice::<StreamFlag>(trimmed)
        .ok()
        .and_then(|flag| flag.stream)
        .unwrap_or(false)
}

/// Whether the upstream answered with a server-sent event stream.
pub fn is_event_stream(headers: &reqwest::header::HeaderMap) -> bool {
    headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().starts_with("text/event-stream"))
        .unwrap_or(false)
}
