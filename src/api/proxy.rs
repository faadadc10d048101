//! Transparent forwarding with retry before commitment.
//!
//! Every request that is not a router endpoint ends up in
//! [`forward_request`]. The body is buffered once, then each attempt picks
//! the next endpoint of the active provider, swaps in its credential and sends
//! the request. Failures are retried on another endpoint until a response has
//! been committed to the client or the attempt budget runs out.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::Response,
};
use bytes::Bytes;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

use crate::api::auth::verify_auth;
use crate::api::handlers::AppState;
use crate::api::streaming::commit_stream;
use crate::api::upstream::{
    build_upstream_request, build_upstream_url, classify_transport_error, is_event_stream,
    is_retryable_status, next_backoff, sends_body, wants_streaming, Disposition,
};
use crate::core::config::RequestConfig;
use crate::core::error::{AppError, Result};
use crate::core::header_policy::{sanitize_upstream_headers, strip_denied_headers};
use crate::core::ip_filter::{ClientIp, UNKNOWN_CLIENT};
use crate::core::request_log::RequestLog;
use crate::core::telemetry::{self, Level};
use crate::services::{Endpoint, EndpointSelector, HttpPool};
use crate::telemetry_fields;

/// A buffered inbound request, ready to be replayed against any endpoint.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    /// Inbound headers with the deny-list already applied.
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Client asked for a streamed response.
    pub streaming: bool,
}

impl ForwardRequest {
    pub fn new(method: Method, uri: &axum::http::Uri, headers: &HeaderMap, body: Bytes) -> Self {
        let streaming = wants_streaming(headers, &body);
        Self {
            method,
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            headers: strip_denied_headers(headers),
            body,
            streaming,
        }
    }
}

/// Retry loop over the endpoint selector and the client pool.
pub struct ProxyEngine {
    selector: Arc<EndpointSelector>,
    pool: Arc<HttpPool>,
    request_log: Option<Arc<RequestLog>>,
}

impl ProxyEngine {
    pub fn new(selector: Arc<EndpointSelector>, pool: Arc<HttpPool>) -> Self {
        Self {
            selector,
            pool,
            request_log: None,
        }
    }

    /// Record every attempt and upstream response in `log`.
    pub fn with_request_log(mut self, log: Option<Arc<RequestLog>>) -> Self {
        self.request_log = log;
        self
    }

    /// Forward `request`, retrying until a response is committed.
    pub async fn forward(&self, settings: &RequestConfig, request: &ForwardRequest) -> Result<Response> {
        let max_attempts = settings.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let endpoint = self.selector.get_current_endpoint()?;
            let is_last = attempt == max_attempts;

            match self.attempt(settings, request, &endpoint, attempt, is_last).await {
                Ok(response) => {
                    tracing::debug!(
                        attempt,
                        base_url = %endpoint.base_url,
                        status = response.status().as_u16(),
                        "Upstream responded"
                    );
                    return Ok(response);
                }
                Err(Disposition::Terminal(message)) => {
                    tracing::error!(
                        attempt,
                        base_url = %endpoint.base_url,
                        error = %message,
                        "Upstream request failed permanently"
                    );
                    telemetry::emit(
                        Level::Error,
                        "upstream request failed permanently",
                        telemetry_fields! {
                            "attempt" => attempt,
                            "base_url" => endpoint.base_url,
                            "error" => message,
                        },
                    );
                    if let Some(log) = &self.request_log {
                        log.error(
                            "upstream_terminal",
                            &message,
                            json!({ "attempt": attempt, "base_url": endpoint.base_url }),
                        );
                    }
                    return Err(AppError::Upstream(message));
                }
                Err(Disposition::Retryable(message)) => {
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        base_url = %endpoint.base_url,
                        error = %message,
                        "Upstream attempt failed"
                    );
                    telemetry::emit(
                        Level::Warn,
                        "upstream attempt failed",
                        telemetry_fields! {
                            "attempt" => attempt,
                            "max_attempts" => max_attempts,
                            "base_url" => endpoint.base_url,
                            "error" => message,
                        },
                    );
                    last_error = message;

                    if !is_last {
                        let delay = next_backoff(attempt, settings.backoff_base, settings.backoff_max);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        tracing::error!(
            attempts = max_attempts,
            error = %last_error,
            method = %request.method,
            path = %request.path,
            "Upstream retries exhausted"
        );
        telemetry::emit(
            Level::Error,
            "upstream retries exhausted",
            telemetry_fields! {
                "attempts" => max_attempts,
                "method" => request.method.as_str(),
                "path" => request.path,
                "error" => last_error,
            },
        );

        if let Some(log) = &self.request_log {
            log.error(
                "upstream_exhausted",
                &last_error,
                json!({
                    "attempts": max_attempts,
                    "method": request.method.as_str(),
                    "path": request.path,
                }),
            );
        }

        Err(AppError::UpstreamExhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    /// One attempt against one endpoint.
    ///
    /// A retryable status is surfaced as a failure except on the last attempt,
    /// where the upstream response goes back to the client as is.
    async fn attempt(
        &self,
        settings: &RequestConfig,
        request: &ForwardRequest,
        endpoint: &Endpoint,
        attempt: u32,
        is_last: bool,
    ) -> std::result::Result<Response, Disposition> {
        let client = self
            .pool
            .client_for(&endpoint.base_url)
            .map_err(|e| Disposition::Terminal(e.to_string()))?;

        let url = build_upstream_url(&endpoint.base_url, &request.path, request.query.as_deref());
        let body = sends_body(&request.method).then(|| request.body.clone());
        if let Some(log) = &self.request_log {
            log.forward_request(
                attempt,
                request.method.as_str(),
                &url,
                &request.headers,
                body.as_deref(),
            );
        }
        let upstream_request = build_upstream_request(
            &client,
            &request.method,
            &url,
            &request.headers,
            &endpoint.api_key,
            body,
        )
        .map_err(|e| Disposition::Terminal(e.to_string()))?;

        let started = Instant::now();
        let response = match tokio::time::timeout(settings.request_timeout, upstream_request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, is_connect = e.is_connect(), "Upstream transport error");
                return Err(classify_transport_error(&e));
            }
            Err(_) => {
                return Err(Disposition::Retryable(
                    "upstream request timed out".to_string(),
                ))
            }
        };

        let status = response.status().as_u16();
        if !is_last && is_retryable_status(status) {
            if let Some(log) = &self.request_log {
                let headers = sanitize_upstream_headers(response.headers());
                log.forward_response(attempt, &url, status, &headers, false, None);
            }
            // Dropping the response releases the connection
            drop(response);
            return Err(Disposition::Retryable(format!(
                "upstream returned status {}",
                status
            )));
        }

        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut headers = sanitize_upstream_headers(response.headers());
        let sse = is_event_stream(response.headers());
        let remaining = settings.request_timeout.saturating_sub(started.elapsed());

        if sse || request.streaming {
            if let Some(log) = &self.request_log {
                log.forward_response(attempt, &url, status.as_u16(), &headers, true, None);
            }
            // SSE commits after one heartbeat of silence; other streams wait
            // for their first byte until the request deadline.
            let (heartbeat, window) = if sse {
                (Some(settings.heartbeat_interval), settings.heartbeat_interval)
            } else {
                (None, remaining)
            };
            return commit_stream(status, headers, response.bytes_stream(), heartbeat, window).await;
        }

        // A HEAD response has no body to measure; keep the upstream length.
        if request.method == Method::HEAD {
            if let Some(length) = response.headers().get(reqwest::header::CONTENT_LENGTH) {
                if let Ok(length) = HeaderValue::from_bytes(length.as_bytes()) {
                    headers.insert(header::CONTENT_LENGTH, length);
                }
            }
        }

        let body = match tokio::time::timeout(remaining, response.bytes()).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => return Err(classify_transport_error(&e)),
            Err(_) => {
                return Err(Disposition::Retryable(
                    "upstream response timed out".to_string(),
                ))
            }
        };

        if let Some(log) = &self.request_log {
            log.forward_response(attempt, &url, status.as_u16(), &headers, false, Some(&body));
        }

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Catch-all handler: authenticate, buffer the body and forward.
pub async fn forward_request(State(state): State<Arc<AppState>>, request: Request) -> Result<Response> {
    let settings = state.settings.load_full();
    verify_auth(request.headers(), &settings)?;

    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, settings.max_body_bytes)
        .await
        .map_err(|e| AppError::Validation(format!("failed to read request body: {}", e)))?;

    if let Some(log) = &state.request_log {
        let client_ip = parts
            .extensions
            .get::<ClientIp>()
            .map(|ip| ip.0.as_str())
            .unwrap_or(UNKNOWN_CLIENT);
        log.request_start(
            parts.method.as_str(),
            parts.uri.path(),
            parts.uri.query(),
            &parts.headers,
            client_ip,
            &body,
        );
    }

    let forward = ForwardRequest::new(parts.method, &parts.uri, &parts.headers, body);
    tracing::debug!(
        method = %forward.method,
        path = %forward.path,
        streaming = forward.streaming,
        body_bytes = forward.body.len(),
        "Forwarding request"
    );

    state.engine.forward(&settings, &forward).await
}
