//! Canonical header deny-list shared by the inbound and outbound paths.
//!
//! Requests lose hop-by-hop, proxy-identifying and credential headers before
//! they are forwarded; upstream responses lose the same set before they are
//! returned. Everything else passes through verbatim.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use once_cell::sync::Lazy;
use std::collections::HashSet;

/// Exact header names that never cross the proxy.
const DENIED_HEADERS: &[&str] = &[
    // credentials, replaced per endpoint
    "authorization",
    "x-api-key",
    "proxy-authorization",
    // hop-by-hop / connection management
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    // recomputed by the HTTP stack
    "content-length",
    "expect",
    // proxy and CDN traces
    "cdn-loop",
    "via",
    "forwarded",
    "true-client-ip",
    "x-real-ip",
];

/// Header name prefixes that never cross the proxy.
const DENIED_PREFIXES: &[&str] = &["x-forwarded-", "cf-"];

static DENIED_SET: Lazy<HashSet<&'static str>> =
    Lazy::new(|| DENIED_HEADERS.iter().copied().collect());

/// Whether `name` is on the deny-list.
pub fn is_denied(name: &HeaderName) -> bool {
    let name = name.as_str();
    DENIED_SET.contains(name) || DENIED_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

/// Return a copy of `headers` without denied entries. Multi-valued headers keep
/// every value in order.
pub fn strip_denied_headers(headers: &HeaderMap) -> HeaderMap {
    let mut kept = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_denied(name) {
            kept.append(name.clone(), value.clone());
        }
    }
    kept
}

/// Convert an upstream (reqwest) header map into an axum one and strip it.
pub fn sanitize_upstream_headers(upstream: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut converted = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) else {
            continue;
        };
        if !is_denied(&name) {
            converted.append(name, value);
        }
    }
    converted
}

/// Convert an already stripped axum header map into reqwest's header type.
pub fn to_upstream_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut converted = reqwest::header::HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) else {
            continue;
        };
        converted.append(name, value);
    }
    converted
}
