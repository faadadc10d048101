//! HTTP middleware for request context, access logging and client gating.
//!
//! [`request_context_middleware`] wraps every request in a request-id scope
//! and writes the access log line. [`rate_limit_gate`] resolves the client
//! address, applies the static blocklist and the per-IP token bucket, and
//! annotates admitted responses with the bucket state.

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::core::blocklist::Blocklist;
use crate::core::error::AppError;
use crate::core::ip_filter::{resolve_client_ip, ClientIp, UNKNOWN_CLIENT};
use crate::core::logging::{request_id_for, REQUEST_ID};
use crate::core::rate_limiter::{BucketSnapshot, TokenBucketLimiter};
use crate::core::request_log::RequestLog;
use crate::core::telemetry::{self, Level};
use crate::telemetry_fields;

// ============================================================================
// Request context
// ============================================================================

/// Scope the request id and log one access line per request.
///
/// The id comes from an inbound `x-request-id` when present, otherwise a
/// fresh UUID. The client address is read back from the response's
/// [`ClientIp`] extension set by the gate.
pub async fn request_context_middleware(request: Request, next: Next) -> Response {
    let request_id = request_id_for(request.headers());

    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = REQUEST_ID.scope(request_id.clone(), next.run(request)).await;

    let duration = start.elapsed().as_secs_f64();
    let client_ip = response
        .extensions()
        .get::<ClientIp>()
        .map(|ip| ip.0.as_str())
        .unwrap_or(UNKNOWN_CLIENT);

    tracing::info!(
        request_id = %request_id,
        client_ip = %client_ip,
        "{} {} - status={} duration={:.3}s",
        method,
        path,
        response.status().as_u16(),
        duration
    );

    response
}

// ============================================================================
// Rate limit gate
// ============================================================================

/// Per-client admission: blocklist first, then the token bucket.
pub struct RateLimitGate {
    limiter: Option<Arc<TokenBucketLimiter>>,
    blocklist: Option<Arc<Blocklist>>,
    trust_proxy: bool,
    request_log: Option<Arc<RequestLog>>,
}

impl RateLimitGate {
    pub fn new(
        limiter: Option<Arc<TokenBucketLimiter>>,
        blocklist: Option<Arc<Blocklist>>,
        trust_proxy: bool,
    ) -> Self {
        Self {
            limiter,
            blocklist,
            trust_proxy,
            request_log: None,
        }
    }

    /// Record gate decisions in `log`.
    pub fn with_request_log(mut self, log: Option<Arc<RequestLog>>) -> Self {
        self.request_log = log;
        self
    }

    /// A gate that admits everything.
    pub fn disabled() -> Self {
        Self::new(None, None, true)
    }

    pub fn limiter(&self) -> Option<&Arc<TokenBucketLimiter>> {
        self.limiter.as_ref()
    }

    pub fn blocklist(&self) -> Option<&Arc<Blocklist>> {
        self.blocklist.as_ref()
    }

    pub fn trust_proxy(&self) -> bool {
        self.trust_proxy
    }

    /// Decide for `client_ip`. An admitted request gets the bucket state to
    /// report, when limiting is enabled.
    pub fn admit(&self, client_ip: &str) -> Result<Option<BucketSnapshot>, AppError> {
        if let Some(blocklist) = &self.blocklist {
            if blocklist.contains(client_ip) {
                tracing::warn!(client_ip = %client_ip, "Blocked client rejected");
                telemetry::emit(
                    Level::Warn,
                    "blocked client rejected",
                    telemetry_fields! { "client_ip" => client_ip },
                );
                if let Some(log) = &self.request_log {
                    log.ip_block(client_ip);
                }
                return Err(AppError::BlockedClient);
            }
        }

        let Some(limiter) = &self.limiter else {
            return Ok(None);
        };

        let (allowed, snapshot) = limiter.acquire(client_ip);
        if let Some(log) = &self.request_log {
            log.rate_limit(client_ip, allowed, &snapshot);
        }
        if !allowed {
            telemetry::emit(
                Level::Warn,
                "rate limit exceeded",
                telemetry_fields! {
                    "client_ip" => client_ip,
                    "retry_after_secs" => snapshot.retry_after_secs(),
                    "limit" => limiter.requests_per_minute(),
                },
            );
            return Err(AppError::RateLimitExceeded(snapshot));
        }
        Ok(Some(snapshot))
    }

    /// Start the limiter sweep and the blocklist poller.
    pub async fn start(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.start().await;
        }
        if let Some(blocklist) = &self.blocklist {
            blocklist.start().await;
        }
    }

    /// Stop background tasks and wait for them.
    pub async fn close(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.close().await;
        }
        if let Some(blocklist) = &self.blocklist {
            blocklist.close().await;
        }
    }
}

/// Middleware applying a [`RateLimitGate`] to every request.
pub async fn rate_limit_gate(
    State(gate): State<Arc<RateLimitGate>>,
    mut request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let client_ip = resolve_client_ip(request.headers(), peer, gate.trust_proxy);

    let snapshot = match gate.admit(&client_ip) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            let mut response = e.into_response();
            response.extensions_mut().insert(ClientIp(client_ip));
            return response;
        }
    };

    request.extensions_mut().insert(ClientIp(client_ip.clone()));
    let mut response = next.run(request).await;

    if let Some(snapshot) = snapshot {
        snapshot.apply_headers(response.headers_mut());
    }
    response.extensions_mut().insert(ClientIp(client_ip));
    response
}
