//! Shared, monotonically advancing stream cursor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The highest sequence number fully processed so far.
///
/// Cloned handles share one value. The reader task reads it when
/// building a reconnect URL; the consumer advances it after each commit.
/// Internally stores `seq + 1` so that zero can mean "no cursor".
#[derive(Debug, Clone, Default)]
pub struct SharedCursor {
    inner: Arc<AtomicU64>,
}

impl SharedCursor {
    /// Creates a cursor starting at `initial`.
    #[must_use]
    pub fn new(initial: Option<u64>) -> Self {
        let raw = initial.map_or(0, |seq| seq.saturating_add(1));
        Self {
            inner: Arc::new(AtomicU64::new(raw)),
        }
    }

    /// Returns the current cursor, or `None` if nothing has been processed.
    #[must_use]
    pub fn get(&self) -> Option<u64> {
        match self.inner.load(Ordering::Acquire) {
            0 => None,
            raw => Some(raw - 1),
        }
    }

    /// Moves the cursor to `seq` if that is ahead of the current value.
    ///
    /// Returns `true` if the cursor moved.
    pub fn advance(&self, seq: u64) -> bool {
        let raw = seq.saturating_add(1);
        self.inner.fetch_max(raw, Ordering::AcqRel) < raw
    }
}
