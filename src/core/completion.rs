//! Completion flag shared between a relay stream and its body wrapper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set once a relayed stream reached its end on its own.
///
/// A body dropped while the flag is still clear was abandoned by the client.
#[derive(Clone, Default)]
pub struct StreamCompletion {
    completed: Arc<AtomicBool>,
}

impl StreamCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the relay ended by itself (upstream EOF or upstream break).
    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}
