//! Firehose source connector metrics.
//!
//! [`FirehoseSourceMetrics`] provides lock-free atomic counters for the
//! socket reader, readable as a serializable [`FirehoseMetricsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic counters for firehose source statistics.
///
/// All counters use `Relaxed` ordering. Snapshots are consistent enough
/// for monitoring, not for accounting.
#[derive(Debug, Default)]
pub struct FirehoseSourceMetrics {
    /// Binary frames received from the relay.
    pub messages_received: AtomicU64,
    /// Raw payload bytes received.
    pub bytes_received: AtomicU64,
    /// Frames that failed to decode and were skipped.
    pub decode_errors: AtomicU64,
    /// Frames dropped for exceeding the size limit.
    pub oversized_dropped: AtomicU64,
    /// Non-binary data frames ignored.
    pub text_frames_ignored: AtomicU64,
    /// Successful connections (initial plus reconnects).
    pub connects: AtomicU64,
    /// Reconnect attempts scheduled after an unexpected close.
    pub reconnects: AtomicU64,
    /// Error frames (`op = -1`) sent by the relay.
    pub error_frames: AtomicU64,
}

impl FirehoseSourceMetrics {
    /// Creates a new metrics instance with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a received frame with the given payload size.
    pub fn record_message(&self, bytes: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records a frame that failed to decode.
    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a frame dropped for size.
    pub fn record_oversized(&self) {
        self.oversized_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an ignored text frame.
    pub fn record_text_frame(&self) {
        self.text_frames_ignored.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a successful connection.
    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a scheduled reconnect attempt.
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a relay error frame.
    pub fn record_error_frame(&self) {
        self.error_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> FirehoseMetricsSnapshot {
        FirehoseMetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            oversized_dropped: self.oversized_dropped.load(Ordering::Relaxed),
            text_frames_ignored: self.text_frames_ignored.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            error_frames: self.error_frames.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`FirehoseSourceMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct FirehoseMetricsSnapshot {
    pub messages_received: u64,
    pub bytes_received: u64,
    pub decode_errors: u64,
    pub oversized_dropped: u64,
    pub text_frames_ignored: u64,
    pub connects: u64,
    pub reconnects: u64,
    pub error_frames: u64,
}
