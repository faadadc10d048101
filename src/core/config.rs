//! Configuration management for the router.
//!
//! All settings come from environment variables (optionally seeded from a
//! `.env` file by the binary). Parsing goes through a key lookup function so
//! tests can feed a map instead of mutating the process environment.

use anyhow::{bail, Result};

use crate::core::telemetry::Level;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// Upstream providers in index order.
    pub providers: Vec<ProviderConfig>,
    /// Provider active at startup.
    pub current_provider_index: usize,
    pub request: RequestConfig,
    pub pool: PoolConfig,
    pub rate_limit: RateLimitConfig,
    pub blocklist: BlocklistConfig,
    pub telemetry: TelemetryConfig,
    pub request_log: RequestLogConfig,
}

/// One provider: parallel lists of equivalent endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub base_urls: Vec<String>,
    pub api_keys: Vec<String>,
}

impl ProviderConfig {
    pub fn new<U: Into<String>, K: Into<String>>(endpoints: impl IntoIterator<Item = (U, K)>) -> Self {
        let (base_urls, api_keys) = endpoints
            .into_iter()
            .map(|(url, key)| (url.into(), key.into()))
            .unzip();
        Self {
            base_urls,
            api_keys,
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// Settings read by every forwarded request. Swappable at runtime.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    /// Inbound bearer key; empty disables authentication.
    pub auth_key: String,
    /// Deadline for a buffered upstream exchange (headers and body).
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// SSE heartbeat cadence, also the window for the first streamed chunk.
    pub heartbeat_interval: Duration,
    pub max_body_bytes: usize,
}

impl RequestConfig {
    pub fn auth_enabled(&self) -> bool {
        !self.auth_key.is_empty()
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            auth_key: String::new(),
            request_timeout: Duration::from_secs(60),
            max_attempts: 3,
            backoff_base: Duration::from_millis(800),
            backoff_max: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(25),
            max_body_bytes: 100 * 1024 * 1024,
        }
    }
}

/// Upstream connection pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_idle_per_host: usize,
    pub verify_ssl: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            max_idle_per_host: 60,
            verify_ssl: true,
        }
    }
}

/// Per-IP rate limiting settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_minute: i64,
    pub burst_size: i64,
    pub trust_proxy: bool,
    pub sweep_interval: Duration,
    pub idle_ttl: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_minute: 100,
            burst_size: 10,
            trust_proxy: true,
            sweep_interval: Duration::from_secs(60),
            idle_ttl: Duration::from_secs(600),
        }
    }
}

/// Static IP blocklist settings.
#[derive(Debug, Clone)]
pub struct BlocklistConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub poll_interval: Duration,
}

impl Default for BlocklistConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("ip_blocklist.txt"),
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// Remote telemetry sink settings.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Collector URL; `None` disables the sink.
    pub endpoint: Option<String>,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            batch_size: 50,
            flush_interval: Duration::from_millis(1000),
        }
    }
}

/// Local JSON-lines request log.
#[derive(Debug, Clone)]
pub struct RequestLogConfig {
    pub enabled: bool,
    pub path: PathBuf,
    /// Records below this level are not written.
    pub level: Level,
    /// Size at which the active file is rotated; 0 disables rotation.
    pub max_bytes: u64,
    /// Rotated files kept next to the active one.
    pub max_files: usize,
    pub buffer_size: usize,
}

impl Default for RequestLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("logs/cil-router.jsonl"),
            level: Level::Debug,
            max_bytes: 12 * 1024 * 1024,
            max_files: 8,
            buffer_size: 1000,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            providers: Vec::new(),
            current_provider_index: 0,
            request: RequestConfig::default(),
            pool: PoolConfig::default(),
            rate_limit: RateLimitConfig::default(),
            blocklist: BlocklistConfig::default(),
            telemetry: TelemetryConfig::default(),
            request_log: RequestLogConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup: &lookup };
        let defaults = AppConfig::default();

        let server = ServerConfig {
            host: env.string("HOST").unwrap_or(defaults.server.host),
            port: env.parse("PORT", defaults.server.port),
        };

        let request = RequestConfig {
            auth_key: env.string("AUTH_KEY").unwrap_or_default(),
            request_timeout: env.secs("REQUEST_TIMEOUT", defaults.request.request_timeout),
            max_attempts: env.parse("MAX_ATTEMPTS", defaults.request.max_attempts).max(1),
            backoff_base: env.millis("RETRY_BACKOFF_BASE_MS", defaults.request.backoff_base),
            backoff_max: env.millis("RETRY_BACKOFF_MAX_MS", defaults.request.backoff_max),
            heartbeat_interval: env.secs(
                "HEARTBEAT_INTERVAL_SECS",
                defaults.request.heartbeat_interval,
            ),
            max_body_bytes: env.parse("MAX_BODY_BYTES", defaults.request.max_body_bytes),
        };

        let pool = PoolConfig {
            connect_timeout: env.secs("CONNECT_TIMEOUT", defaults.pool.connect_timeout),
            idle_timeout: env.secs("POOL_IDLE_TIMEOUT_SECS", defaults.pool.idle_timeout),
            max_idle_per_host: env.parse("POOL_MAX_IDLE_PER_HOST", defaults.pool.max_idle_per_host),
            verify_ssl: env.flag("VERIFY_SSL", defaults.pool.verify_ssl),
        };

        let rate_limit = RateLimitConfig {
            enabled: env.flag("RATE_LIMIT_ENABLED", defaults.rate_limit.enabled),
            requests_per_minute: env.parse("RATE_LIMIT_RPM", defaults.rate_limit.requests_per_minute),
            burst_size: env.parse("RATE_LIMIT_BURST", defaults.rate_limit.burst_size),
            trust_proxy: env.flag("RATE_LIMIT_TRUST_PROXY", defaults.rate_limit.trust_proxy),
            sweep_interval: env.secs("RATE_LIMIT_SWEEP_SECS", defaults.rate_limit.sweep_interval),
            idle_ttl: env.secs("RATE_LIMIT_IDLE_TTL_SECS", defaults.rate_limit.idle_ttl),
        };

        let blocklist = BlocklistConfig {
            enabled: env.flag("IP_BLOCKLIST_ENABLED", defaults.blocklist.enabled),
            path: env
                .string("IP_BLOCKLIST_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.blocklist.path),
            poll_interval: env.secs("IP_BLOCKLIST_POLL_SECS", defaults.blocklist.poll_interval),
        };

        let telemetry = TelemetryConfig {
            endpoint: env.string("TELEMETRY_ENDPOINT"),
            batch_size: env.parse("TELEMETRY_BATCH_SIZE", defaults.telemetry.batch_size),
            flush_interval: env.millis("TELEMETRY_FLUSH_MS", defaults.telemetry.flush_interval),
        };

        let request_log = RequestLogConfig {
            enabled: env.flag("REQUEST_LOG_ENABLED", defaults.request_log.enabled),
            path: env
                .string("REQUEST_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.request_log.path),
            level: env.parse("REQUEST_LOG_LEVEL", defaults.request_log.level),
            max_bytes: env.parse("REQUEST_LOG_MAX_BYTES", defaults.request_log.max_bytes),
            max_files: env.parse("REQUEST_LOG_MAX_FILES", defaults.request_log.max_files),
            buffer_size: env
                .parse("REQUEST_LOG_BUFFER_SIZE", defaults.request_log.buffer_size)
                .max(1),
        };

        let config = AppConfig {
            server,
            providers: load_providers(&lookup)?,
            current_provider_index: env.parse("CURRENT_PROVIDER_INDEX", 0),
            request,
            pool,
            rate_limit,
            blocklist,
            telemetry,
            request_log,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        for (index, provider) in self.providers.iter().enumerate() {
            if provider.base_urls.len() != provider.api_keys.len() {
                bail!(
                    "provider {} has {} base URLs but {} API keys",
                    index,
                    provider.base_urls.len(),
                    provider.api_keys.len()
                );
            }
            if provider.base_urls.is_empty() {
                bail!("provider {} has no endpoints", index);
            }
        }
        if self.rate_limit.enabled
            && (self.rate_limit.requests_per_minute <= 0 || self.rate_limit.burst_size <= 0)
        {
            bail!(
                "rate limiting needs positive RATE_LIMIT_RPM and RATE_LIMIT_BURST (got {} and {})",
                self.rate_limit.requests_per_minute,
                self.rate_limit.burst_size
            );
        }
        Ok(())
    }
}

/// Read `PROVIDER_{N}_BASE_URL` / `PROVIDER_{N}_API_KEY` pairs from N = 0
/// until both are absent.
pub fn load_providers<F>(lookup: &F) -> Result<Vec<ProviderConfig>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut providers = Vec::new();

    for index in 0.. {
        let urls = lookup(&format!("PROVIDER_{}_BASE_URL", index));
        let keys = lookup(&format!("PROVIDER_{}_API_KEY", index));

        let (urls, keys) = match (urls, keys) {
            (None, None) => break,
            (Some(urls), Some(keys)) => (urls, keys),
            (Some(_), None) => bail!("PROVIDER_{}_API_KEY is missing", index),
            (None, Some(_)) => bail!("PROVIDER_{}_BASE_URL is missing", index),
        };

        let base_urls = split_list(&urls);
        let api_keys = split_list(&keys);
        if base_urls.len() != api_keys.len() {
            bail!(
                "PROVIDER_{} lists {} base URLs but {} API keys",
                index,
                base_urls.len(),
                api_keys.len()
            );
        }

        providers.push(ProviderConfig {
            base_urls,
            api_keys,
        });
    }

    Ok(providers)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Convert string to boolean.
///
/// Accepts: "true", "1", "yes", "on" (case-insensitive) as true.
pub fn str_to_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        match self.string(key) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(key, value = %raw, "Invalid value, using default");
                default
            }),
            None => default,
        }
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.string(key).map(|v| str_to_bool(&v)).unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        match self.string(key) {
            Some(raw) => match raw.parse::<f64>() {
                Ok(secs) if secs.is_finite() && secs > 0.0 => Duration::from_secs_f64(secs),
                _ => {
                    tracing::warn!(key, value = %raw, "Invalid duration, using default");
                    default
                }
            },
            None => default,
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        Duration::from_millis(self.parse(key, default.as_millis() as u64))
    }
}
