//! Routing services: which endpoint gets a request, and the clients that
//! carry it there.

pub mod endpoint_selector;
pub mod http_pool;

pub use endpoint_selector::{Endpoint, EndpointSelector, ProviderInfo};
pub use http_pool::HttpPool;
