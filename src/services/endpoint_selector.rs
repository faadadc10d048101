//! Provider and endpoint selection.
//!
//! One provider is active at a time; requests rotate round-robin through its
//! endpoints. The provider table is an immutable snapshot behind `arc-swap`
//! so reads never lock, and a reload replaces it wholesale.

use arc_swap::ArcSwap;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::config::ProviderConfig;
use crate::core::error::AppError;

/// One upstream credential pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub base_url: String,
    pub api_key: String,
}

/// Public view of a provider. Never carries API keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderInfo {
    pub index: usize,
    pub endpoint_count: usize,
    pub base_urls: Vec<String>,
}

struct ProviderEntry {
    endpoints: Vec<Endpoint>,
    cursor: AtomicUsize,
}

impl ProviderEntry {
    fn from_config(config: &ProviderConfig) -> Self {
        let endpoints = config
            .base_urls
            .iter()
            .zip(config.api_keys.iter())
            .map(|(url, key)| Endpoint {
                base_url: url.trim_end_matches('/').to_string(),
                api_key: key.clone(),
            })
            .collect();
        Self {
            endpoints,
            cursor: AtomicUsize::new(0),
        }
    }

    fn next(&self) -> Option<&Endpoint> {
        if self.endpoints.is_empty() {
            return None;
        }
        let position = self.cursor.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        self.endpoints.get(position)
    }

    fn info(&self, index: usize) -> ProviderInfo {
        ProviderInfo {
            index,
            endpoint_count: self.endpoints.len(),
            base_urls: self.endpoints.iter().map(|e| e.base_url.clone()).collect(),
        }
    }
}

fn build_table(providers: &[ProviderConfig]) -> Vec<ProviderEntry> {
    providers.iter().map(ProviderEntry::from_config).collect()
}

/// Active-provider switch plus per-provider round-robin cursors.
pub struct EndpointSelector {
    table: ArcSwap<Vec<ProviderEntry>>,
    active: AtomicUsize,
}

impl EndpointSelector {
    pub fn new(providers: &[ProviderConfig], active_index: usize) -> Self {
        let table = build_table(providers);
        let active = if active_index < table.len() {
            active_index
        } else {
            if !table.is_empty() {
                tracing::warn!(
                    requested = active_index,
                    provider_count = table.len(),
                    "Initial provider index out of range, using provider 0"
                );
            }
            0
        };

        Self {
            table: ArcSwap::from_pointee(table),
            active: AtomicUsize::new(active),
        }
    }

    /// Next endpoint of the active provider.
    ///
    /// Fails with `AppError::Configuration` when no provider or endpoint exists.
    pub fn get_current_endpoint(&self) -> Result<Endpoint, AppError> {
        let table = self.table.load();
        if table.is_empty() {
            return Err(AppError::Configuration(
                "no upstream providers configured".to_string(),
            ));
        }

        let index = self.active.load(Ordering::Acquire);
        // A reload may shrink the table between the two loads
        let provider = table.get(index).unwrap_or(&table[0]);

        provider.next().cloned().ok_or_else(|| {
            AppError::Configuration(format!("provider {} has no endpoints", index))
        })
    }

    /// Switch the active provider. Out-of-range indexes leave state untouched.
    pub fn select_provider(&self, index: usize) -> bool {
        let count = self.provider_count();
        if index >= count {
            tracing::debug!(index, provider_count = count, "Rejected provider switch");
            return false;
        }
        let previous = self.active.swap(index, Ordering::AcqRel);
        tracing::info!(from = previous, to = index, "Switched active provider");
        true
    }

    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn provider_count(&self) -> usize {
        self.table.load().len()
    }

    pub fn endpoint_count(&self, index: usize) -> Option<usize> {
        self.table.load().get(index).map(|p| p.endpoints.len())
    }

    pub fn describe(&self, index: usize) -> Option<ProviderInfo> {
        self.table.load().get(index).map(|p| p.info(index))
    }

    pub fn describe_all(&self) -> Vec<ProviderInfo> {
        self.table
            .load()
            .iter()
            .enumerate()
            .map(|(index, p)| p.info(index))
            .collect()
    }

    /// Replace the provider table. Cursors restart; the active index survives
    /// when still in range.
    pub fn reload(&self, providers: &[ProviderConfig]) {
        let table = build_table(providers);
        let count = table.len();
        self.table.store(Arc::new(table));

        let active = self.active.load(Ordering::Acquire);
        if active >= count {
            self.active.store(0, Ordering::Release);
        }

        tracing::info!(
            provider_count = count,
            active_index = self.active_index(),
            "Reloaded provider table"
        );
    }

    /// Log the provider table at startup.
    pub fn log_providers(&self) {
        let providers = self.describe_all();
        tracing::info!(
            "Starting CIL router with {} providers (active: {})",
            providers.len(),
            self.active_index()
        );
        for info in &providers {
            tracing::info!(
                "  - provider {}: {} endpoints {:?}",
                info.index,
                info.endpoint_count,
                info.base_urls
            );
        }
    }
}
