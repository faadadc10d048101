//! JSON-lines request log written to a local, size-rotated file.
//!
//! Records cover the life of a proxied request (arrival, each forwarded
//! attempt, each upstream response) plus gate decisions, provider switches
//! and errors. Writing never blocks a request: records go through a bounded
//! channel to a background writer, and a full channel drops the record.
//!
//! Credentials never reach the file. Every record is passed through
//! [`mask_sensitive`] before it is queued.

use axum::http::HeaderMap;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::core::config::RequestLogConfig;
use crate::core::logging::get_request_id;
use crate::core::rate_limiter::BucketSnapshot;
use crate::core::telemetry::Level;

/// Replacement written in place of a sensitive value.
pub const MASK: &str = "***";

/// Model output fields longer than this are cut in logged bodies.
pub const MODEL_PREVIEW_CHARS: usize = 200;

/// Bodies larger than this are summarized instead of logged.
pub const MAX_LOGGED_BODY_BYTES: usize = 256 * 1024;

const FLUSH_BATCH: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Key names (lowercase, `_` folded to `-`) whose values are masked.
const SENSITIVE_KEYS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "x-api-key",
    "api-key",
    "apikey",
    "auth-key",
    "cookie",
    "set-cookie",
    "password",
    "secret",
    "client-secret",
    "token",
    "access-token",
    "refresh-token",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    RequestStart,
    ForwardRequest,
    ForwardResponse,
    RateLimit,
    IpBlock,
    ProviderSwitch,
    Error,
}

/// One line of the log file.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: String,
    pub level: Level,
    #[serde(rename = "type")]
    pub kind: RecordKind,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl LogRecord {
    pub fn new(level: Level, kind: RecordKind, fields: Map<String, Value>) -> Self {
        let fields = match mask_sensitive(Value::Object(fields)) {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        Self {
            timestamp: chrono::Local::now().to_rfc3339(),
            level,
            kind,
            request_id: get_request_id(),
            fields,
        }
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let folded = key.to_ascii_lowercase().replace('_', "-");
    SENSITIVE_KEYS.contains(&folded.as_str())
}

/// Replace the value of every sensitive key, at any depth, with [`MASK`].
pub fn mask_sensitive(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    if is_sensitive_key(&key) && !value.is_null() {
                        (key, Value::String(MASK.to_string()))
                    } else {
                        (key, mask_sensitive(value))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(mask_sensitive).collect()),
        other => other,
    }
}

/// Headers as a JSON object. Repeated headers are joined with `, `.
pub fn headers_value(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        map.insert(name.as_str().to_string(), Value::String(joined));
    }
    Value::Object(map)
}

/// Render a body for the log: parsed JSON when possible, text otherwise, a
/// placeholder for binary or oversized payloads, `null` when empty.
pub fn body_value(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    if body.len() > MAX_LOGGED_BODY_BYTES {
        return Value::String(format!("<body: {} bytes>", body.len()));
    }
    match std::str::from_utf8(body) {
        Ok(text) => match serde_json::from_str::<Value>(text) {
            Ok(parsed) => truncate_model_output(parsed),
            Err(_) => Value::String(text.to_string()),
        },
        Err(_) => Value::String(format!("<binary data: {} bytes>", body.len())),
    }
}

/// Shorten `choices[].message.content` and `choices[].text`.
fn truncate_model_output(mut value: Value) -> Value {
    if let Some(choices) = value.get_mut("choices").and_then(Value::as_array_mut) {
        for choice in choices {
            if let Some(content) = choice.pointer_mut("/message/content") {
                shorten(content);
            }
            if let Some(text) = choice.get_mut("text") {
                shorten(text);
            }
        }
    }
    value
}

fn shorten(value: &mut Value) {
    if let Value::String(text) = value {
        if text.chars().count() > MODEL_PREVIEW_CHARS {
            *text = text.chars().take(MODEL_PREVIEW_CHARS).collect();
        }
    }
}

// ============================================================================
// Logger
// ============================================================================

struct WriterTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Handle for queueing records to the file writer.
pub struct RequestLog {
    sender: mpsc::Sender<LogRecord>,
    min_level: Level,
    path: PathBuf,
    writer: Mutex<Option<WriterTask>>,
}

impl RequestLog {
    /// Spawn the writer for `config`. The file and its directory are created
    /// by the writer on first use.
    pub fn start(config: &RequestLogConfig) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(config.buffer_size.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(write_records(
            receiver,
            shutdown_rx,
            config.path.clone(),
            config.max_bytes,
            config.max_files,
        ));

        tracing::info!(
            path = %config.path.display(),
            level = ?config.level,
            max_bytes = config.max_bytes,
            max_files = config.max_files,
            "Request log enabled"
        );

        Arc::new(Self {
            sender,
            min_level: config.level,
            path: config.path.clone(),
            writer: Mutex::new(Some(WriterTask { shutdown, handle })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn enabled_for(&self, level: Level) -> bool {
        level >= self.min_level
    }

    /// Queue a record without waiting.
    pub fn record(&self, level: Level, kind: RecordKind, fields: Map<String, Value>) {
        if !self.enabled_for(level) {
            return;
        }
        if let Err(e) = self.sender.try_send(LogRecord::new(level, kind, fields)) {
            tracing::debug!(error = %e, "Dropping request log record");
        }
    }

    pub fn request_start(
        &self,
        method: &str,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        client_ip: &str,
        body: &[u8],
    ) {
        if !self.enabled_for(Level::Debug) {
            return;
        }
        self.record(
            Level::Debug,
            RecordKind::RequestStart,
            fields(json!({
                "method": method,
                "path": path,
                "query": query,
                "headers": headers_value(headers),
                "client_ip": client_ip,
                "body": body_value(body),
            })),
        );
    }

    pub fn forward_request(
        &self,
        attempt: u32,
        method: &str,
        url: &str,
        headers: &HeaderMap,
        body: Option<&[u8]>,
    ) {
        if !self.enabled_for(Level::Debug) {
            return;
        }
        self.record(
            Level::Debug,
            RecordKind::ForwardRequest,
            fields(json!({
                "attempt": attempt,
                "method": method,
                "url": url,
                "headers": headers_value(headers),
                "body": body.map(body_value),
            })),
        );
    }

    /// `body` is `None` for streamed responses, which are not captured.
    pub fn forward_response(
        &self,
        attempt: u32,
        url: &str,
        status: u16,
        headers: &HeaderMap,
        streaming: bool,
        body: Option<&[u8]>,
    ) {
        if !self.enabled_for(Level::Debug) {
            return;
        }
        self.record(
            Level::Debug,
            RecordKind::ForwardResponse,
            fields(json!({
                "attempt": attempt,
                "url": url,
                "status_code": status,
                "headers": headers_value(headers),
                "streaming": streaming,
                "body": body.map(body_value),
            })),
        );
    }

    pub fn rate_limit(&self, client_ip: &str, allowed: bool, snapshot: &BucketSnapshot) {
        let level = if allowed { Level::Debug } else { Level::Warn };
        self.record(
            level,
            RecordKind::RateLimit,
            fields(json!({
                "client_ip": client_ip,
                "allowed": allowed,
                "bucket": {
                    "tokens": snapshot.tokens,
                    "capacity": snapshot.capacity,
                    "refill_rate": snapshot.refill_rate,
                },
            })),
        );
    }

    pub fn ip_block(&self, client_ip: &str) {
        self.record(
            Level::Warn,
            RecordKind::IpBlock,
            fields(json!({ "client_ip": client_ip, "blocked": true })),
        );
    }

    pub fn provider_switch(&self, old_index: usize, new_index: i64, success: bool) {
        let level = if success { Level::Info } else { Level::Error };
        self.record(
            level,
            RecordKind::ProviderSwitch,
            fields(json!({
                "old_index": old_index,
                "new_index": new_index,
                "success": success,
            })),
        );
    }

    pub fn error(&self, error_type: &str, message: &str, details: Value) {
        self.record(
            Level::Error,
            RecordKind::Error,
            fields(json!({
                "error_type": error_type,
                "error_message": message,
                "error_details": details,
            })),
        );
    }

    /// Stop the writer after it has written everything already queued.
    pub async fn close(&self) {
        let task = self.writer.lock().await.take();
        if let Some(WriterTask { shutdown, handle }) = task {
            let _ = shutdown.send(true);
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Request log writer ended abnormally");
            }
        }
    }
}

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

// ============================================================================
// Writer
// ============================================================================

async fn write_records(
    mut receiver: mpsc::Receiver<LogRecord>,
    mut shutdown_rx: watch::Receiver<bool>,
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
) {
    let mut file = match RotatingFile::open(path, max_bytes, max_files).await {
        Ok(file) => file,
        Err(e) => {
            tracing::error!(error = %e, "Failed to open request log, records will be dropped");
            return;
        }
    };

    let mut buffer: Vec<LogRecord> = Vec::with_capacity(FLUSH_BATCH);
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            received = receiver.recv() => match received {
                Some(record) => {
                    buffer.push(record);
                    if buffer.len() >= FLUSH_BATCH {
                        file.write_batch(&mut buffer).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => file.write_batch(&mut buffer).await,
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    while let Ok(record) = receiver.try_recv() {
                        buffer.push(record);
                    }
                    break;
                }
            }
        }
    }

    file.write_batch(&mut buffer).await;
    tracing::info!("Request log writer stopped");
}

/// Append-only file rotated as `path`, `path.1` .. `path.N` (oldest last).
struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    file: File,
    size: u64,
}

impl RotatingFile {
    async fn open(path: PathBuf, max_bytes: u64, max_files: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = open_append(&path).await?;
        let size = file.metadata().await?.len();
        Ok(Self {
            path,
            max_bytes,
            max_files,
            file,
            size,
        })
    }

    async fn write_batch(&mut self, buffer: &mut Vec<LogRecord>) {
        if buffer.is_empty() {
            return;
        }
        for record in buffer.drain(..) {
            let mut line = match serde_json::to_vec(&record) {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize request log record");
                    continue;
                }
            };
            line.push(b'\n');
            if let Err(e) = self.write_line(&line).await {
                tracing::error!(error = %e, "Failed to write request log");
            }
        }
        if let Err(e) = self.file.flush().await {
            tracing::error!(error = %e, "Failed to flush request log");
        }
    }

    async fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        if self.max_bytes > 0 && self.size > 0 && self.size + line.len() as u64 > self.max_bytes {
            self.rotate().await?;
        }
        self.file.write_all(line).await?;
        self.size += line.len() as u64;
        Ok(())
    }

    async fn rotate(&mut self) -> io::Result<()> {
        self.file.flush().await?;

        if self.max_files == 0 {
            tokio::fs::remove_file(&self.path).await?;
        } else {
            ignore_missing(tokio::fs::remove_file(rotated_path(&self.path, self.max_files)).await)?;
            for n in (1..self.max_files).rev() {
                ignore_missing(
                    tokio::fs::rename(
                        rotated_path(&self.path, n),
                        rotated_path(&self.path, n + 1),
                    )
                    .await,
                )?;
            }
            tokio::fs::rename(&self.path, rotated_path(&self.path, 1)).await?;
        }

        self.file = open_append(&self.path).await?;
        self.size = 0;
        tracing::debug!(path = %self.path.display(), "Rotated request log");
        Ok(())
    }
}

async fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

fn rotated_path(path: &Path, n: usize) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(format!(".{}", n));
    PathBuf::from(name)
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
