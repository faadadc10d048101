//! Per-client token bucket rate limiting.
//!
//! Buckets are keyed by resolved client IP, created full on first use and
//! refilled lazily from elapsed wall-clock time. A background sweep evicts
//! buckets that have been idle longer than the configured TTL so memory stays
//! bounded under high source-address cardinality.

use axum::http::{HeaderMap, HeaderValue};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::core::error::AppError;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: f64, refill_rate: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    fn snapshot(&self) -> BucketSnapshot {
        BucketSnapshot {
            tokens: self.tokens,
            capacity: self.capacity,
            refill_rate: self.refill_rate,
        }
    }
}

/// Point-in-time view of one bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketSnapshot {
    pub tokens: f64,
    pub capacity: f64,
    /// Tokens per second.
    pub refill_rate: f64,
}

impl BucketSnapshot {
    /// Whole tokens left.
    pub fn remaining(&self) -> u64 {
        self.tokens.max(0.0).floor() as u64
    }

    /// Seconds until at least one token is available (never below 1).
    pub fn retry_after_secs(&self) -> u64 {
        let missing = (1.0 - self.tokens).max(0.0);
        seconds_for(missing, self.refill_rate).max(1)
    }

    /// Seconds until the bucket is full again.
    pub fn reset_after_secs(&self) -> u64 {
        let missing = (self.capacity - self.tokens).max(0.0);
        seconds_for(missing, self.refill_rate)
    }

    /// Write the `X-RateLimit-*` informational headers.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(
            "x-ratelimit-limit",
            HeaderValue::from(self.capacity.floor() as u64),
        );
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining()));
        headers.insert("x-ratelimit-reset", HeaderValue::from(self.reset_after_secs()));
    }
}

fn seconds_for(tokens: f64, refill_rate: f64) -> u64 {
    if tokens <= 0.0 || refill_rate <= 0.0 {
        return 0;
    }
    (tokens / refill_rate).ceil() as u64
}

/// Sweep task handle plus its stop signal.
struct SweepTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Token bucket limiter keyed by client identifier.
pub struct TokenBucketLimiter {
    buckets: Arc<DashMap<String, TokenBucket>>,
    requests_per_minute: i64,
    capacity: f64,
    refill_rate: f64,
    sweep_interval: Duration,
    idle_ttl: Duration,
    sweep: Mutex<Option<SweepTask>>,
}

impl TokenBucketLimiter {
    /// Create a limiter admitting `requests_per_minute` on average with bursts
    /// of up to `burst_size`.
    ///
    /// Both values must be positive.
    pub fn new(requests_per_minute: i64, burst_size: i64) -> Result<Self, AppError> {
        if requests_per_minute <= 0 {
            return Err(AppError::Configuration(format!(
                "requests_per_minute must be positive, got {}",
                requests_per_minute
            )));
        }
        if burst_size <= 0 {
            return Err(AppError::Configuration(format!(
                "burst_size must be positive, got {}",
                burst_size
            )));
        }

        Ok(Self {
            buckets: Arc::new(DashMap::new()),
            requests_per_minute,
            capacity: burst_size as f64,
            refill_rate: requests_per_minute as f64 / 60.0,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            idle_ttl: DEFAULT_IDLE_TTL,
            sweep: Mutex::new(None),
        })
    }

    /// Override sweep cadence and idle eviction threshold.
    pub fn with_sweep(mut self, interval: Duration, idle_ttl: Duration) -> Self {
        self.sweep_interval = interval;
        self.idle_ttl = idle_ttl;
        self
    }

    pub fn requests_per_minute(&self) -> i64 {
        self.requests_per_minute
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Consume one token for `key` if available.
    pub fn allow(&self, key: &str) -> bool {
        self.acquire(key).0
    }

    /// Refill, check and consume atomically, returning the decision together
    /// with the bucket state after it.
    pub fn acquire(&self, key: &str) -> (bool, BucketSnapshot) {
        let now = Instant::now();
        let mut entry = self.buckets.entry(key.to_string()).or_insert_with(|| {
            tracing::debug!(
                client = %key,
                capacity = self.capacity,
                refill_rate = self.refill_rate,
                "Created token bucket"
            );
            TokenBucket::full(self.capacity, self.refill_rate)
        });

        let bucket = entry.value_mut();
        bucket.refill(now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            (true, bucket.snapshot())
        } else {
            let snapshot = bucket.snapshot();
            tracing::warn!(
                client = %key,
                tokens = snapshot.tokens,
                capacity = snapshot.capacity,
                "Rate limit exceeded"
            );
            (false, snapshot)
        }
    }

    /// Current state of `key`'s bucket, if one exists.
    pub fn status(&self, key: &str) -> Option<BucketSnapshot> {
        let mut entry = self.buckets.get_mut(key)?;
        entry.refill(Instant::now());
        Some(entry.snapshot())
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Drop buckets idle longer than the TTL, returning how many were removed.
    pub fn sweep_idle(&self) -> usize {
        sweep_buckets(&self.buckets, self.idle_ttl)
    }

    /// Spawn the background sweep. Calling it twice keeps the first task.
    pub async fn start(&self) {
        let mut sweep = self.sweep.lock().await;
        if sweep.is_some() {
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let buckets = self.buckets.clone();
        let interval = self.sweep_interval;
        let idle_ttl = self.idle_ttl;

        let handle = tokio::spawn(async move {
            tracing::info!(
                interval_secs = interval.as_secs_f64(),
                idle_ttl_secs = idle_ttl.as_secs_f64(),
                "Rate limiter sweep started"
            );
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = sweep_buckets(&buckets, idle_ttl);
                        if removed > 0 {
                            tracing::info!(
                                removed_entries = removed,
                                remaining_entries = buckets.len(),
                                "Evicted idle token buckets"
                            );
                        } else {
                            tracing::debug!(remaining_entries = buckets.len(), "Token bucket sweep");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Rate limiter sweep stopped");
        });

        *sweep = Some(SweepTask { shutdown, handle });
    }

    /// Stop the sweep and wait for it to finish.
    pub async fn close(&self) {
        let task = self.sweep.lock().await.take();
        if let Some(SweepTask { shutdown, handle }) = task {
            let _ = shutdown.send(true);
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Rate limiter sweep task ended abnormally");
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.sweep.lock().await.is_some()
    }
}

fn sweep_buckets(buckets: &DashMap<String, TokenBucket>, idle_ttl: Duration) -> usize {
    let now = Instant::now();
    let before = buckets.len();
    buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) <= idle_ttl);
    before.saturating_sub(buckets.len())
}
