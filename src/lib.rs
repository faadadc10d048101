//! CIL Router - a transparent reverse proxy for upstream API providers
//!
//! The router forwards arbitrary HTTP requests, streams included, to the
//! active provider while swapping in the provider's credential:
//!
//! - **Round-robin endpoints**: each provider holds several equivalent
//!   `(base_url, api_key)` pairs used in turn
//! - **Provider switching**: `POST /select` changes the active provider at runtime
//! - **Retry before commit**: transient failures move on to the next endpoint
//!   until the first response byte has reached the client
//! - **Streaming**: SSE passthrough with heartbeat comments during upstream silence
//! - **Client gating**: per-IP token bucket and a file-backed IP blocklist
//!
//! # Architecture
//!
//! - [`core`]: configuration, errors, logging context, telemetry, middleware,
//!   rate limiting and client identification
//! - [`services`]: endpoint selection and pooled upstream clients
//! - [`api`]: router endpoints, forwarding engine and streaming relay
//!
//! # Configuration
//!
//! Providers are read from `PROVIDER_{N}_BASE_URL` / `PROVIDER_{N}_API_KEY`
//! (comma-separated lists, N counting from 0). Optional variables:
//! - `HOST` / `PORT`: listener (default 0.0.0.0:8000)
//! - `AUTH_KEY`: inbound bearer key (auth disabled when empty)
//! - `CURRENT_PROVIDER_INDEX`: initial active provider (default 0)
//! - `RATE_LIMIT_ENABLED`, `RATE_LIMIT_RPM`, `RATE_LIMIT_BURST`: client limiting
//! - `IP_BLOCKLIST_ENABLED`, `IP_BLOCKLIST_PATH`: static blocklist

pub mod api;
pub mod core;
pub mod services;

// Re-export commonly used types for convenience
pub use api::{create_router, AppState};
pub use core::{AppConfig, AppError, Result};
pub use services::{EndpointSelector, HttpPool};
