//! Client IP resolution through the proxy-trust chain.
//!
//! When proxies are trusted, forwarding headers are consulted in a fixed
//! priority order and the first syntactically valid address wins. Resolution
//! never fails: every malformed source falls through to the next one, ending
//! at the socket peer or the [`UNKNOWN_CLIENT`] sentinel.

use axum::http::HeaderMap;
use std::net::IpAddr;

/// Key used when no address can be determined.
pub const UNKNOWN_CLIENT: &str = "unknown-client";

const CF_CONNECTING_IP: &str = "cf-connecting-ip";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Headers whose presence means the request passed through Cloudflare.
const CLOUDFLARE_MARKERS: &[&str] = &["cf-ipcountry", "cf-ray", "cf-visitor"];

/// Resolved client address, attached to requests and responses as an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

/// Resolve the address a request should be attributed to.
///
/// Priority with `trust_proxy`: `CF-Connecting-IP`, then the first
/// `X-Forwarded-For` hop when a Cloudflare marker is present, then
/// `X-Real-IP`, then the first `X-Forwarded-For` hop, then `peer`.
pub fn resolve_client_ip(headers: &HeaderMap, peer: Option<IpAddr>, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(ip) = header_ip(headers, CF_CONNECTING_IP) {
            return ip;
        }

        if is_behind_cloudflare(headers) {
            if let Some(ip) = first_forwarded_ip(headers) {
                return ip;
            }
        }

        if let Some(ip) = header_ip(headers, X_REAL_IP) {
            return ip;
        }

        if let Some(ip) = first_forwarded_ip(headers) {
            return ip;
        }
    }

    match peer {
        Some(ip) => ip.to_string(),
        None => UNKNOWN_CLIENT.to_string(),
    }
}

/// Parse an address, tolerating surrounding whitespace and IPv6 brackets.
pub fn parse_ip(candidate: &str) -> Option<IpAddr> {
    let trimmed = candidate
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']');
    trimmed.parse::<IpAddr>().ok()
}

pub fn is_valid_ip(candidate: &str) -> bool {
    parse_ip(candidate).is_some()
}

fn is_behind_cloudflare(headers: &HeaderMap) -> bool {
    CLOUDFLARE_MARKERS
        .iter()
        .any(|marker| headers.contains_key(*marker))
}

fn header_ip(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(name)?.to_str().ok()?;
    parse_ip(value).map(|ip| ip.to_string())
}

fn first_forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(X_FORWARDED_FOR)?.to_str().ok()?;
    let first = value.split(',').next()?;
    parse_ip(first).map(|ip| ip.to_string())
}
