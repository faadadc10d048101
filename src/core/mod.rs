//! Core functionality for the router.
//!
//! This module contains fundamental components used throughout the application:
//! - Configuration management
//! - Error handling
//! - Request context, telemetry, the file request log and HTTP middleware
//! - Client identification, blocklist and rate limiting

pub mod blocklist;
pub mod completion;
pub mod config;
pub mod error;
pub mod header_policy;
pub mod ip_filter;
pub mod logging;
pub mod middleware;
pub mod rate_limiter;
pub mod request_log;
pub mod telemetry;

// Re-export commonly used types
pub use blocklist::Blocklist;
pub use completion::StreamCompletion;
pub use config::{AppConfig, ProviderConfig, RequestConfig, ServerConfig};
pub use error::{AppError, Result};
pub use ip_filter::{resolve_client_ip, ClientIp};
pub use logging::{get_request_id, REQUEST_ID};
pub use middleware::{rate_limit_gate, request_context_middleware, RateLimitGate};
pub use rate_limiter::{BucketSnapshot, TokenBucketLimiter};
pub use request_log::RequestLog;
