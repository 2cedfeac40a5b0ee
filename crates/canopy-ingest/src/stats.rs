//! Operational statistics.
//!
//! [`IngestStats`] is written only from the orchestrator's processing loop
//! and read from anywhere through a [`StatsHandle`], which produces the
//! serializable [`HealthSnapshot`] and [`StatsSnapshot`] consumed by an
//! external health endpoint.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use canopy_connectors::firehose::{
    ConnectionState, FirehoseMetricsSnapshot, FirehoseSourceMetrics, OpAction, SharedCursor,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::event::DomainEvent;
use crate::handler::{HandlerOutcome, SkipReason};

/// Counters and diagnostics for one orchestrator instance.
#[derive(Debug)]
pub struct IngestStats {
    started: Instant,
    commits: AtomicU64,
    events: AtomicU64,
    events_skipped_missing_record: AtomicU64,
    events_unhandled: AtomicU64,
    sequence_regressions: AtomicU64,
    transport_errors: AtomicU64,
    checkpoint_saves: AtomicU64,
    checkpoint_failures: AtomicU64,
    by_collection: Mutex<BTreeMap<String, u64>>,
    errors_by_category: Mutex<BTreeMap<&'static str, u64>>,
    recent: Mutex<VecDeque<RecentEvent>>,
    recent_capacity: usize,
    last_processed: Mutex<Option<LastProcessed>>,
}

impl IngestStats {
    /// Creates empty stats keeping the last `recent_capacity` events.
    #[must_use]
    pub fn new(recent_capacity: usize) -> Self {
        Self {
            started: Instant::now(),
            commits: AtomicU64::new(0),
            events: AtomicU64::new(0),
            events_skipped_missing_record: AtomicU64::new(0),
            events_unhandled: AtomicU64::new(0),
            sequence_regressions: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
            checkpoint_saves: AtomicU64::new(0),
            checkpoint_failures: AtomicU64::new(0),
            by_collection: Mutex::new(BTreeMap::new()),
            errors_by_category: Mutex::new(BTreeMap::new()),
            recent: Mutex::new(VecDeque::with_capacity(recent_capacity)),
            recent_capacity: recent_capacity.max(1),
            last_processed: Mutex::new(None),
        }
    }

    /// Records a fully processed commit.
    pub fn record_commit(&self, seq: u64, time: DateTime<Utc>) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        *self.last_processed.lock() = Some(LastProcessed { seq, time });
    }

    /// Records an event a handler completed, whatever it decided to do.
    pub fn record_handled(&self, event: &DomainEvent, outcome: HandlerOutcome) {
        self.events.fetch_add(1, Ordering::Relaxed);
        *self
            .by_collection
            .lock()
            .entry(event.collection.clone())
            .or_insert(0) += 1;
        if outcome == HandlerOutcome::Skipped(SkipReason::MissingRecord) {
            self.events_skipped_missing_record
                .fetch_add(1, Ordering::Relaxed);
        }
        self.push_recent(event, outcome.as_str());
    }

    /// Records an event in a routed collection with no registered handler.
    pub fn record_unhandled(&self, event: &DomainEvent) {
        self.events_unhandled.fetch_add(1, Ordering::Relaxed);
        self.push_recent(event, "unhandled");
    }

    /// Records a failed handler call under `category`.
    pub fn record_handler_error(&self, event: &DomainEvent, category: &'static str) {
        *self.errors_by_category.lock().entry(category).or_insert(0) += 1;
        self.push_recent(event, "error");
    }

    /// Records a commit whose sequence did not increase.
    pub fn record_sequence_regression(&self) {
        self.sequence_regressions.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a transport error signal from the source.
    pub fn record_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a checkpoint save attempt.
    pub fn record_checkpoint(&self, ok: bool) {
        if ok {
            self.checkpoint_saves.fetch_add(1, Ordering::Relaxed);
        } else {
            self.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Seconds since these stats were created.
    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    fn push_recent(&self, event: &DomainEvent, outcome: &str) {
        let mut recent = self.recent.lock();
        if recent.len() == self.recent_capacity {
            recent.pop_front();
        }
        recent.push_back(RecentEvent {
            uri: event.uri.clone(),
            collection: event.collection.clone(),
            action: event.action,
            seq: event.seq,
            time: event.time,
            outcome: outcome.to_string(),
        });
    }

    fn counters(&self, source: FirehoseMetricsSnapshot) -> Counters {
        let errors_by_category = self
            .errors_by_category
            .lock()
            .iter()
            .map(|(k, v)| ((*k).to_string(), *v))
            .collect::<BTreeMap<_, _>>();
        Counters {
            commits: self.commits.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            events_by_collection: self.by_collection.lock().clone(),
            events_skipped_missing_record: self
                .events_skipped_missing_record
                .load(Ordering::Relaxed),
            events_unhandled: self.events_unhandled.load(Ordering::Relaxed),
            errors: errors_by_category.values().sum(),
            errors_by_category,
            sequence_regressions: self.sequence_regressions.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            checkpoint_saves: self.checkpoint_saves.load(Ordering::Relaxed),
            checkpoint_failures: self.checkpoint_failures.load(Ordering::Relaxed),
            messages_received: source.messages_received,
            bytes_received: source.bytes_received,
            decode_errors: source.decode_errors,
            oversized_dropped: source.oversized_dropped,
            error_frames: source.error_frames,
            connects: source.connects,
            reconnects: source.reconnects,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LastProcessed {
    seq: u64,
    time: DateTime<Utc>,
}

/// Entry in the recent-events ring buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentEvent {
    /// Record URI.
    pub uri: String,
    /// Record collection.
    pub collection: String,
    /// Mutation kind.
    pub action: OpAction,
    /// Commit sequence number.
    pub seq: u64,
    /// Commit time.
    pub time: DateTime<Utc>,
    /// `upserted`, `deleted`, `skipped`, `unhandled` or `error`.
    pub outcome: String,
}

/// The most recently processed commit and how far behind it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastProcessedSnapshot {
    /// Commit sequence number.
    pub seq: u64,
    /// Commit time.
    pub time: DateTime<Utc>,
    /// `now - time` in milliseconds, floored at zero.
    pub lag_ms: u64,
}

/// Coarse health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Connected and consuming.
    Ok,
    /// Connecting or waiting to reconnect.
    Degraded,
    /// Disconnected or stopped.
    Down,
}

impl From<ConnectionState> for HealthStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Connected => HealthStatus::Ok,
            ConnectionState::Connecting | ConnectionState::Reconnecting => HealthStatus::Degraded,
            ConnectionState::Disconnected | ConnectionState::Stopped => HealthStatus::Down,
        }
    }
}

/// Body of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    /// Coarse status.
    pub status: HealthStatus,
    /// Whether the relay connection is open.
    pub connected: bool,
    /// Current in-memory cursor.
    pub cursor: Option<u64>,
}

/// Aggregate counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Counters {
    pub commits: u64,
    /// Events a handler completed. Unhandled and failed events are counted
    /// separately.
    pub events: u64,
    /// Completed events per collection.
    pub events_by_collection: BTreeMap<String, u64>,
    pub events_skipped_missing_record: u64,
    pub events_unhandled: u64,
    pub errors: u64,
    pub errors_by_category: BTreeMap<String, u64>,
    pub sequence_regressions: u64,
    pub transport_errors: u64,
    pub checkpoint_saves: u64,
    pub checkpoint_failures: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub decode_errors: u64,
    pub oversized_dropped: u64,
    pub error_frames: u64,
    pub connects: u64,
    pub reconnects: u64,
}

/// Body of a stats request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Whether the relay connection is open.
    pub connected: bool,
    /// Connection state name.
    pub state: ConnectionState,
    /// Current in-memory cursor.
    pub cursor: Option<u64>,
    /// Seconds since the orchestrator was created.
    pub uptime_seconds: u64,
    /// Aggregate counters.
    pub counters: Counters,
    /// Most recent events, oldest first.
    pub recent_events: Vec<RecentEvent>,
    /// Most recently processed commit.
    pub last_processed: Option<LastProcessedSnapshot>,
}

/// Cloneable, read-only view of a running orchestrator.
#[derive(Debug, Clone)]
pub struct StatsHandle {
    stats: Arc<IngestStats>,
    cursor: SharedCursor,
    state: watch::Receiver<ConnectionState>,
    source: Arc<FirehoseSourceMetrics>,
}

impl StatsHandle {
    pub(crate) fn new(
        stats: Arc<IngestStats>,
        cursor: SharedCursor,
        state: watch::Receiver<ConnectionState>,
        source: Arc<FirehoseSourceMetrics>,
    ) -> Self {
        Self {
            stats,
            cursor,
            state,
            source,
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Current in-memory cursor.
    #[must_use]
    pub fn cursor(&self) -> Option<u64> {
        self.cursor.get()
    }

    /// Health check body.
    #[must_use]
    pub fn health(&self) -> HealthSnapshot {
        let state = self.state();
        HealthSnapshot {
            status: state.into(),
            connected: state == ConnectionState::Connected,
            cursor: self.cursor(),
        }
    }

    /// Full stats body, with lag measured against the current time.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats_at(Utc::now())
    }

    /// Full stats body, with lag measured against `now`.
    #[must_use]
    pub fn stats_at(&self, now: DateTime<Utc>) -> StatsSnapshot {
        let state = self.state();
        let last_processed = (*self.stats.last_processed.lock()).map(|last| {
            let lag_ms = (now - last.time).num_milliseconds();
            LastProcessedSnapshot {
                seq: last.seq,
                time: last.time,
                lag_ms: u64::try_from(lag_ms).unwrap_or(0),
            }
        });
        StatsSnapshot {
            connected: state == ConnectionState::Connected,
            state,
            cursor: self.cursor(),
            uptime_seconds: self.stats.uptime_seconds(),
            counters: self.stats.counters(self.source.snapshot()),
            recent_events: self.stats.recent.lock().iter().cloned().collect(),
            last_processed,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::event::record_uri;

    fn event(rkey: &str, seq: u64) -> DomainEvent {
        DomainEvent {
            repo: "did:example:1".into(),
            uri: record_uri("did:example:1", "org.example.comment", rkey),
            collection: "org.example.comment".into(),
            rkey: rkey.into(),
            cid: None,
            action: OpAction::Create,
            record: None,
            seq,
            time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    fn handle(stats: Arc<IngestStats>, state: ConnectionState) -> StatsHandle {
        let (tx, rx) = watch::channel(state);
        // The receiver keeps the last value after the sender is gone.
        drop(tx);
        StatsHandle::new(
            stats,
            SharedCursor::new(Some(7)),
            rx,
            Arc::new(FirehoseSourceMetrics::new()),
        )
    }

    #[test]
    fn test_ring_buffer_keeps_latest() {
        let stats = Arc::new(IngestStats::new(3));
        for seq in 1..=5 {
            stats.record_handled(&event(&format!("r{seq}"), seq), HandlerOutcome::Upserted);
        }

        let snap = handle(Arc::clone(&stats), ConnectionState::Connected).stats();
        let seqs: Vec<_> = snap.recent_events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(snap.counters.events, 5);
        assert_eq!(snap.counters.events_by_collection["org.example.comment"], 5);
    }

    #[test]
    fn test_error_categories() {
        let stats = Arc::new(IngestStats::new(10));
        stats.record_handler_error(&event("a", 1), "store");
        stats.record_handler_error(&event("b", 2), "store");
        stats.record_handler_error(&event("c", 3), "handler");

        let snap = handle(stats, ConnectionState::Connected).stats();
        assert_eq!(snap.counters.errors, 3);
        assert_eq!(snap.counters.errors_by_category["store"], 2);
        assert_eq!(snap.counters.errors_by_category["handler"], 1);
        assert_eq!(snap.recent_events.len(), 3);
        assert!(snap.recent_events.iter().all(|e| e.outcome == "error"));
    }

    #[test]
    fn test_only_completed_events_counted_as_handled() {
        let stats = Arc::new(IngestStats::new(10));
        stats.record_handled(&event("a", 1), HandlerOutcome::Upserted);
        stats.record_handled(
            &event("b", 2),
            HandlerOutcome::Skipped(SkipReason::MissingRecord),
        );
        stats.record_unhandled(&event("c", 3));
        stats.record_handler_error(&event("d", 4), "store");

        let snap = handle(stats, ConnectionState::Connected).stats();
        assert_eq!(snap.counters.events, 2);
        assert_eq!(snap.counters.events_by_collection["org.example.comment"], 2);
        assert_eq!(snap.counters.events_skipped_missing_record, 1);
        assert_eq!(snap.counters.events_unhandled, 1);
        assert_eq!(snap.counters.errors, 1);

        let outcomes: Vec<_> = snap.recent_events.iter().map(|e| e.outcome.as_str()).collect();
        assert_eq!(outcomes, vec!["upserted", "skipped", "unhandled", "error"]);
    }

    #[test]
    fn test_lag() {
        let stats = Arc::new(IngestStats::new(10));
        let time = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        stats.record_commit(99, time);

        let h = handle(stats, ConnectionState::Connected);
        let last = h.stats_at(time + Duration::seconds(3)).last_processed.unwrap();
        assert_eq!(last.seq, 99);
        assert_eq!(last.lag_ms, 3_000);

        // Clock skew never reports negative lag.
        let last = h.stats_at(time - Duration::seconds(1)).last_processed.unwrap();
        assert_eq!(last.lag_ms, 0);
    }

    #[test]
    fn test_health_status() {
        let stats = Arc::new(IngestStats::new(10));
        let health = handle(Arc::clone(&stats), ConnectionState::Connected).health();
        assert_eq!(health.status, HealthStatus::Ok);
        assert!(health.connected);
        assert_eq!(health.cursor, Some(7));

        let health = handle(Arc::clone(&stats), ConnectionState::Reconnecting).health();
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(!health.connected);

        let health = handle(stats, ConnectionState::Stopped).health();
        assert_eq!(health.status, HealthStatus::Down);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let stats = Arc::new(IngestStats::new(10));
        stats.record_handled(&event("a", 1), HandlerOutcome::Upserted);
        let snap = handle(stats, ConnectionState::Connected).stats();

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["connected"], true);
        assert_eq!(json["cursor"], 7);
        assert!(json["uptimeSeconds"].is_u64());
        assert_eq!(json["recentEvents"][0]["action"], "create");
        assert!(json["lastProcessed"].is_null());

        let connecting = handle(Arc::new(IngestStats::new(1)), ConnectionState::Connecting);
        let health = serde_json::to_value(connecting.health()).unwrap();
        assert_eq!(health["status"], "degraded");
    }
}
