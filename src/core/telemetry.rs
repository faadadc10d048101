//! Fire-and-forget remote log sink.
//!
//! Events are queued on a bounded channel and shipped in batches as JSON
//! arrays by a background task. Emitting never blocks and never fails the
//! caller: a full queue or an unreachable collector only costs the events.

use arc_swap::ArcSwapOption;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::logging::get_request_id;

const QUEUE_CAPACITY: usize = 1024;

/// Process-wide sink used by [`emit`].
static GLOBAL_SINK: ArcSwapOption<TelemetrySink> = ArcSwapOption::const_empty();

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::str::FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            other => Err(format!("unknown level {:?}", other)),
        }
    }
}

/// One telemetry record. Caller fields are flattened next to the fixed ones.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    pub timestamp: String,
    pub level: Level,
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TelemetryEvent {
    pub fn new(level: Level, message: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level,
            message: message.into(),
            request_id: get_request_id(),
            fields,
        }
    }
}

/// Handle for queueing events to the shipper task.
pub struct TelemetrySink {
    sender: mpsc::Sender<TelemetryEvent>,
}

impl TelemetrySink {
    /// Start a shipper posting batches to `endpoint`.
    ///
    /// The task exits after flushing once every sink handle has been dropped.
    pub fn start(
        endpoint: String,
        batch_size: usize,
        flush_interval: Duration,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let handle = tokio::spawn(ship_events(
            receiver,
            client,
            endpoint,
            batch_size.max(1),
            flush_interval,
        ));

        (Arc::new(Self { sender }), handle)
    }

    /// Queue an event without waiting. Dropped if the queue is full.
    pub fn send(&self, event: TelemetryEvent) {
        if let Err(e) = self.sender.try_send(event) {
            tracing::debug!(error = %e, "Dropping telemetry event");
        }
    }

    pub fn emit(&self, level: Level, message: &str, fields: Map<String, Value>) {
        self.send(TelemetryEvent::new(level, message, fields));
    }
}

async fn ship_events(
    mut receiver: mpsc::Receiver<TelemetryEvent>,
    client: reqwest::Client,
    endpoint: String,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut buffer: Vec<TelemetryEvent> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);

    loop {
        tokio::select! {
            received = receiver.recv() => match received {
                Some(event) => {
                    buffer.push(event);
                    if buffer.len() >= batch_size {
                        flush(&client, &endpoint, &mut buffer).await;
                    }
                }
                None => {
                    flush(&client, &endpoint, &mut buffer).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                flush(&client, &endpoint, &mut buffer).await;
            }
        }
    }

    tracing::info!("Telemetry shipper stopped");
}

async fn flush(client: &reqwest::Client, endpoint: &str, buffer: &mut Vec<TelemetryEvent>) {
    if buffer.is_empty() {
        return;
    }
    let batch: Vec<TelemetryEvent> = std::mem::take(buffer);

    match client.post(endpoint).json(&batch).send().await {
        Ok(response) if response.status().is_success() => {}
        Ok(response) => {
            tracing::warn!(
                status = response.status().as_u16(),
                events = batch.len(),
                "Telemetry collector rejected batch"
            );
        }
        Err(e) => {
            tracing::warn!(error = %e, events = batch.len(), "Telemetry delivery failed");
        }
    }
}

/// Install `sink` as the process-wide sink.
pub fn install(sink: Arc<TelemetrySink>) {
    GLOBAL_SINK.store(Some(sink));
}

/// Remove the process-wide sink so its shipper can drain and exit.
pub fn uninstall() {
    GLOBAL_SINK.store(None);
}

/// Emit through the process-wide sink; a no-op when none is installed.
pub fn emit(level: Level, message: &str, fields: Map<String, Value>) {
    if let Some(sink) = &*GLOBAL_SINK.load() {
        sink.emit(level, message, fields);
    }
}

/// Build a field map from `key => value` pairs.
#[macro_export]
macro_rules! telemetry_fields {
    ($($key:expr => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut fields = serde_json::Map::new();
        $(fields.insert($key.to_string(), serde_json::json!($value));)*
        fields
    }};
}
