//! CIL Router - Main entry point
//!
//! This binary loads configuration from the environment, wires the router and
//! serves it until Ctrl-C or SIGTERM. On unix, SIGHUP reloads the provider
//! table and request settings without dropping connections.

use anyhow::Result;
use chrono::Local;
use cil_router::{
    core::telemetry::{self, TelemetrySink},
    create_router, AppConfig, AppState,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long shutdown waits for the telemetry shipper to flush.
const TELEMETRY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    // Detect optimal worker threads from environment or cgroup
    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .or_else(detect_cpu_limit)
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });

    println!("Tokio runtime: using {} worker threads", worker_threads);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

/// Custom time formatter that uses local timezone (respects TZ environment variable)
struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S"))
    }
}

fn init_tracing() {
    let no_color = std::env::var("NO_COLOR").is_ok();
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    // Noise suppression for the HTTP stack is always appended, so a bare
    // RUST_LOG=trace does not flood the output with connection internals.
    let base_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,cil_router=debug".to_string());
    let filter = tracing_subscriber::EnvFilter::new(format!(
        "{},hyper=warn,hyper::proto=warn,h2=warn,reqwest=warn",
        base_filter
    ));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_timer(LocalTime)
                    .with_current_span(false),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(LocalTime)
                    .with_ansi(!no_color),
            )
            .init();
    }
}

async fn async_main() -> Result<()> {
    init_tracing();

    let config = AppConfig::from_env()?;
    if config.providers.is_empty() {
        tracing::warn!("No providers configured; proxied requests will fail with 503");
    }

    let telemetry = config.telemetry.endpoint.clone().map(|endpoint| {
        tracing::info!(endpoint = %endpoint, "Telemetry sink enabled");
        let (sink, handle) = TelemetrySink::start(
            endpoint,
            config.telemetry.batch_size,
            config.telemetry.flush_interval,
        );
        telemetry::install(sink.clone());
        (sink, handle)
    });

    let state = Arc::new(AppState::from_config(&config)?);
    state.selector.log_providers();
    state.start().await;

    #[cfg(unix)]
    spawn_reload_listener(state.clone())?;

    let app = create_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("CIL router listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Shutting down");
    state.shutdown().await;

    if let Some((sink, handle)) = telemetry {
        telemetry::uninstall();
        drop(sink);
        if tokio::time::timeout(TELEMETRY_DRAIN_TIMEOUT, handle)
            .await
            .is_err()
        {
            tracing::warn!("Telemetry shipper did not drain in time");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Reload providers and request settings on SIGHUP.
#[cfg(unix)]
fn spawn_reload_listener(state: Arc<AppState>) -> Result<()> {
    let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            tracing::info!("SIGHUP received, reloading configuration");
            dotenvy::dotenv_override().ok();
            match AppConfig::from_env() {
                Ok(config) => state.reload(&config),
                Err(e) => {
                    tracing::error!(error = %e, "Reload failed, keeping current configuration")
                }
            }
        }
    });

    Ok(())
}

fn detect_cpu_limit() -> Option<usize> {
    // cgroup v2
    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some((quota, period)) = max.trim().split_once(' ') {
            if let (Ok(quota), Ok(period)) = (quota.parse::<i64>(), period.parse::<i64>()) {
                if let Some(cores) = quota_to_cores(quota, period) {
                    println!("Detected CPU limit from cgroup v2: {} cores", cores);
                    return Some(cores);
                }
            }
        }
    }

    // cgroup v1
    let read = |path: &str| -> Option<i64> { std::fs::read_to_string(path).ok()?.trim().parse().ok() };
    let cores = quota_to_cores(
        read("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")?,
        read("/sys/fs/cgroup/cpu/cpu.cfs_period_us")?,
    )?;
    println!("Detected CPU limit from cgroup v1: {} cores", cores);
    Some(cores)
}

fn quota_to_cores(quota: i64, period: i64) -> Option<usize> {
    (quota > 0 && period > 0).then(|| ((quota as f64 / period as f64).ceil() as usize).max(1))
}
