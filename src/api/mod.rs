//! HTTP layer: router endpoints, the forwarding engine and streaming relay.

pub mod auth;
pub mod disconnect;
pub mod handlers;
pub mod proxy;
pub mod streaming;
pub mod upstream;

// Re-export commonly used types
pub use handlers::{create_router, AppState};
pub use proxy::{forward_request, ForwardRequest, ProxyEngine};
