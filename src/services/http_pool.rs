//! Pooled upstream HTTP clients, one per base URL.

use dashmap::DashMap;
use std::time::Duration;

use crate::core::config::PoolConfig;
use crate::core::error::AppError;

/// Lazily built `reqwest::Client` per base URL.
///
/// Clients are cheap handles around a shared connection pool, so callers get a
/// clone and the map only guards creation.
pub struct HttpPool {
    clients: DashMap<String, reqwest::Client>,
    settings: PoolConfig,
}

impl HttpPool {
    pub fn new(settings: PoolConfig) -> Self {
        if !settings.verify_ssl {
            tracing::warn!("Upstream TLS certificate verification is disabled");
        }
        Self {
            clients: DashMap::new(),
            settings,
        }
    }

    /// Client for `base_url`, created on first use.
    pub fn client_for(&self, base_url: &str) -> Result<reqwest::Client, AppError> {
        if let Some(client) = self.clients.get(base_url) {
            return Ok(client.clone());
        }

        match self.clients.entry(base_url.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Ok(entry.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let client = build_client(&self.settings).map_err(|e| {
                    AppError::Internal(format!("failed to build HTTP client: {}", e))
                })?;
                tracing::debug!(base_url, "Created pooled upstream client");
                Ok(entry.insert(client).clone())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Drop every client, closing idle connections.
    pub fn close_all(&self) {
        let count = self.clients.len();
        self.clients.clear();
        tracing::info!(clients = count, "Closed upstream connection pools");
    }
}

fn build_client(settings: &PoolConfig) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(!settings.verify_ssl)
        .connect_timeout(settings.connect_timeout)
        .pool_max_idle_per_host(settings.max_idle_per_host)
        .pool_idle_timeout(settings.idle_timeout)
        .tcp_keepalive(Duration::from_secs(60))
        .redirect(reqwest::redirect::Policy::none())
        .build()
}
