//! Router endpoints and shared application state.
//!
//! The router owns exactly two paths: `GET /` reports the provider table and
//! `POST /select` switches the active provider. Every other method and path
//! is forwarded upstream.

use crate::api::auth::verify_auth;
use crate::api::proxy::{forward_request, ProxyEngine};
use crate::core::blocklist::Blocklist;
use crate::core::config::{AppConfig, RequestConfig};
use crate::core::middleware::{rate_limit_gate, request_context_middleware, RateLimitGate};
use crate::core::rate_limiter::TokenBucketLimiter;
use crate::core::request_log::RequestLog;
use crate::core::telemetry::{self, Level};
use crate::core::{AppError, Result};
use crate::services::{EndpointSelector, HttpPool};
use crate::telemetry_fields;
use arc_swap::ArcSwap;
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared application state.
pub struct AppState {
    pub selector: Arc<EndpointSelector>,
    pub pool: Arc<HttpPool>,
    pub engine: ProxyEngine,
    /// Per-request settings, swapped on reload.
    pub settings: ArcSwap<RequestConfig>,
    pub gate: Arc<RateLimitGate>,
    /// File request log, when enabled.
    pub request_log: Option<Arc<RequestLog>>,
}

impl AppState {
    /// Wire every component from configuration. The limiter sweep and the
    /// blocklist poller are not started here; see [`AppState::start`]. The
    /// request log writer is spawned right away, so an enabled request log
    /// needs a running Tokio runtime.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let selector = Arc::new(EndpointSelector::new(
            &config.providers,
            config.current_provider_index,
        ));
        let pool = Arc::new(HttpPool::new(config.pool.clone()));

        let limiter = if config.rate_limit.enabled {
            let limiter = TokenBucketLimiter::new(
                config.rate_limit.requests_per_minute,
                config.rate_limit.burst_size,
            )?
            .with_sweep(config.rate_limit.sweep_interval, config.rate_limit.idle_ttl);
            tracing::info!(
                requests_per_minute = config.rate_limit.requests_per_minute,
                burst_size = config.rate_limit.burst_size,
                trust_proxy = config.rate_limit.trust_proxy,
                "Rate limiting enabled"
            );
            Some(Arc::new(limiter))
        } else {
            None
        };

        let blocklist = config.blocklist.enabled.then(|| {
            tracing::info!(path = %config.blocklist.path.display(), "IP blocklist enabled");
            Arc::new(
                Blocklist::new(&config.blocklist.path)
                    .with_poll_interval(config.blocklist.poll_interval),
            )
        });

        let request_log = config
            .request_log
            .enabled
            .then(|| RequestLog::start(&config.request_log));

        Ok(Self {
            engine: ProxyEngine::new(selector.clone(), pool.clone())
                .with_request_log(request_log.clone()),
            selector,
            pool,
            settings: ArcSwap::from_pointee(config.request.clone()),
            gate: Arc::new(
                RateLimitGate::new(limiter, blocklist, config.rate_limit.trust_proxy)
                    .with_request_log(request_log.clone()),
            ),
            request_log,
        })
    }

    /// Start the limiter sweep and blocklist poller.
    pub async fn start(&self) {
        self.gate.start().await;
    }

    /// Stop background tasks, flush the request log and release upstream
    /// connections.
    pub async fn shutdown(&self) {
        self.gate.close().await;
        if let Some(log) = &self.request_log {
            log.close().await;
        }
        self.pool.close_all();
    }

    /// Apply a freshly loaded configuration: provider table and request
    /// settings. Listener and gate settings need a restart.
    pub fn reload(&self, config: &AppConfig) {
        self.selector.reload(&config.providers);
        self.settings.store(Arc::new(config.request.clone()));
        tracing::info!(
            provider_count = config.providers.len(),
            auth_enabled = config.request.auth_enabled(),
            "Configuration reloaded"
        );
    }
}

/// Build the application router with its middleware stack.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(status).fallback(forward_request))
        .route("/select", post(select_provider).fallback(forward_request))
        .fallback(forward_request)
        .layer(middleware::from_fn_with_state(
            state.gate.clone(),
            rate_limit_gate,
        ))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Report the provider table and the active provider. Never includes keys.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let current_index = state.selector.active_index();

    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "current_index": current_index,
        "provider_count": state.selector.provider_count(),
        "providers": state.selector.describe_all(),
        "current_provider": state.selector.describe(current_index),
    }))
}

/// Switch the active provider. The body is a bare decimal index.
pub async fn select_provider(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    verify_auth(&headers, &state.settings.load())?;

    let raw = std::str::from_utf8(&body)
        .map_err(|_| AppError::Validation("provider index must be an integer".to_string()))?
        .trim();
    let requested: i64 = raw.parse().map_err(|_| {
        AppError::Validation(format!("provider index must be an integer, got {:?}", raw))
    })?;

    let count = state.selector.provider_count();
    let previous = state.selector.active_index();
    let index = usize::try_from(requested)
        .ok()
        .filter(|&index| state.selector.select_provider(index));
    if let Some(log) = &state.request_log {
        log.provider_switch(previous, requested, index.is_some());
    }
    let index = index.ok_or_else(|| {
        AppError::Validation(format!(
            "provider index {} out of range (0..{})",
            requested, count
        ))
    })?;

    telemetry::emit(
        Level::Info,
        "provider switched",
        telemetry_fields! { "current_index" => index },
    );

    Ok(Json(json!({
        "success": true,
        "current_index": index,
        "message": format!("switched to provider {}", index),
        "provider": state.selector.describe(index),
    })))
}
