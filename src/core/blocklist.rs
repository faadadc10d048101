//! File-backed static IP blocklist.
//!
//! The file holds one address per line; `#` starts a comment. A poller
//! re-reads the file whenever its modification time changes and swaps the
//! parsed set in atomically, so lookups never wait on a reload.

use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::core::ip_filter::parse_ip;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Parse blocklist file contents, skipping comments and invalid lines.
pub fn parse_blocklist(contents: &str) -> HashSet<IpAddr> {
    let mut entries = HashSet::new();
    for (line_no, raw) in contents.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        match parse_ip(line) {
            Some(ip) => {
                entries.insert(ip);
            }
            None => {
                tracing::warn!(line = line_no + 1, value = %line, "Ignoring invalid blocklist entry");
            }
        }
    }
    entries
}

struct PollTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    path: PathBuf,
    entries: ArcSwap<HashSet<IpAddr>>,
    last_modified: std::sync::Mutex<Option<SystemTime>>,
}

impl Inner {
    async fn refresh(&self) -> bool {
        let modified = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.modified().ok(),
            Err(e) => {
                let had_entries = !self.entries.load().is_empty();
                let mut last = self.lock_last_modified();
                if last.is_some() || had_entries {
                    tracing::warn!(path = %self.path.display(), error = %e, "Blocklist file unavailable, clearing entries");
                    *last = None;
                    self.entries.store(Arc::new(HashSet::new()));
                    return true;
                }
                return false;
            }
        };

        if modified.is_some() && *self.lock_last_modified() == modified {
            return false;
        }

        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let entries = parse_blocklist(&contents);
                tracing::info!(
                    path = %self.path.display(),
                    entries = entries.len(),
                    "Loaded IP blocklist"
                );
                self.entries.store(Arc::new(entries));
                *self.lock_last_modified() = modified;
                true
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to read blocklist file");
                false
            }
        }
    }

    fn lock_last_modified(&self) -> std::sync::MutexGuard<'_, Option<SystemTime>> {
        self.last_modified
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Static IP blocklist refreshed from disk.
pub struct Blocklist {
    inner: Arc<Inner>,
    poll_interval: Duration,
    poller: Mutex<Option<PollTask>>,
}

impl Blocklist {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: path.as_ref().to_path_buf(),
                entries: ArcSwap::from_pointee(HashSet::new()),
                last_modified: std::sync::Mutex::new(None),
            }),
            poll_interval: DEFAULT_POLL_INTERVAL,
            poller: Mutex::new(None),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Whether `client` (a resolved IP string) is blocked.
    ///
    /// Non-address keys such as the unknown-client sentinel are never blocked.
    pub fn contains(&self, client: &str) -> bool {
        match parse_ip(client) {
            Some(ip) => self.inner.entries.load().contains(&ip),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-read the file if its mtime changed. Returns whether the set changed.
    pub async fn refresh(&self) -> bool {
        self.inner.refresh().await
    }

    /// Load the file and start polling it.
    pub async fn start(&self) {
        let mut poller = self.poller.lock().await;
        if poller.is_some() {
            return;
        }

        self.inner.refresh().await;

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        inner.refresh().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Blocklist poller stopped");
        });

        *poller = Some(PollTask { shutdown, handle });
    }

    /// Stop polling and wait for the poller to exit.
    pub async fn close(&self) {
        let task = self.poller.lock().await.take();
        if let Some(PollTask { shutdown, handle }) = task {
            let _ = shutdown.send(true);
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Blocklist poller ended abnormally");
            }
        }
    }
}
