//! Ingestion orchestrator.
//!
//! The [`Orchestrator`] owns one [`FirehoseSource`], a [`CommitRouter`],
//! the registered [`RecordHandler`]s and the [`CheckpointStore`]. It runs a
//! single processing loop:
//!
//! ```text
//! source.next_event() ─► Commit? ─► router.route() ─► handler.handle() (awaited, in order)
//!                                                   └► cursor.advance(seq)
//! CheckpointScheduler (own timer) ─► reads cursor ─► store.save(seq)
//! ```
//!
//! Frames are processed strictly in arrival order and each handler call is
//! awaited before the next frame is read. On shutdown the source is
//! stopped, the scheduler is cancelled, and one final checkpoint is saved.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use canopy_connectors::firehose::{
    Commit, FirehoseMessage, FirehoseSource, SharedCursor, SourceEvent,
};
use canopy_storage::CheckpointStore;
use tracing::{debug, error, info, warn};

use crate::checkpoint_scheduler::{save_checkpoint, CheckpointScheduler};
use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::handler::RecordHandler;
use crate::router::CommitRouter;
use crate::stats::{IngestStats, StatsHandle};

/// Composition root of the ingestion engine.
pub struct Orchestrator {
    config: IngestConfig,
    router: CommitRouter,
    handlers: HashMap<String, Arc<dyn RecordHandler>>,
    checkpoints: Arc<dyn CheckpointStore>,
    source: FirehoseSource,
    cursor: SharedCursor,
    stats: Arc<IngestStats>,
    /// Sequence of the previous commit on the current connection.
    last_seq: Option<u64>,
}

impl Orchestrator {
    /// Creates an orchestrator. Nothing connects until [`run`](Self::run).
    ///
    /// An explicit `source.cursor` in `config` takes precedence over any
    /// persisted checkpoint.
    #[must_use]
    pub fn new(config: IngestConfig, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        let cursor = SharedCursor::new(config.source.cursor);
        let source = FirehoseSource::new(config.source.clone(), cursor.clone());
        let router = CommitRouter::new(config.collections.iter().cloned());
        let stats = Arc::new(IngestStats::new(config.recent_events_capacity));
        Self {
            config,
            router,
            handlers: HashMap::new(),
            checkpoints,
            source,
            cursor,
            stats,
            last_seq: None,
        }
    }

    /// Registers the handler for one collection.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::UnknownCollection` if the collection is not
    /// routed, or `IngestError::DuplicateHandler` if it already has one.
    pub fn register_handler(
        &mut self,
        collection: impl Into<String>,
        handler: Arc<dyn RecordHandler>,
    ) -> Result<(), IngestError> {
        let collection = collection.into();
        if !self.router.is_recognized(&collection) {
            return Err(IngestError::UnknownCollection(collection));
        }
        if self.handlers.contains_key(&collection) {
            return Err(IngestError::DuplicateHandler(collection));
        }
        debug!(collection = %collection, "registered record handler");
        self.handlers.insert(collection, handler);
        Ok(())
    }

    /// Returns a read-only view for health and stats reporting.
    #[must_use]
    pub fn stats(&self) -> StatsHandle {
        StatsHandle::new(
            Arc::clone(&self.stats),
            self.cursor.clone(),
            self.source.state_watch(),
            self.source.metrics_handle(),
        )
    }

    /// Returns the in-memory cursor.
    #[must_use]
    pub fn cursor(&self) -> Option<u64> {
        self.cursor.get()
    }

    /// Runs until `shutdown` resolves or the source gives up.
    ///
    /// A handler call already in progress when `shutdown` resolves is
    /// allowed to finish. The final checkpoint is saved after the socket
    /// is closed, on every exit path.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Config` for an invalid configuration,
    /// `IngestError::Checkpoint` if the persisted cursor cannot be
    /// read, `IngestError::Connector` if the source cannot start, and
    /// `IngestError::ReconnectExhausted` when the relay stays unreachable.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), IngestError>
    where
        F: Future<Output = ()> + Send,
    {
        self.config.validate()?;
        self.resolve_start_cursor().await?;

        let collections: Vec<&str> = self.router.collections().collect();
        let unhandled: Vec<&str> = collections
            .iter()
            .copied()
            .filter(|c| !self.handlers.contains_key(*c))
            .collect();
        if !unhandled.is_empty() {
            warn!(collections = ?unhandled, "routed collections without a handler");
        }
        info!(
            relay = %self.config.source.relay_url,
            cursor = ?self.cursor.get(),
            collections = ?collections,
            checkpoint_interval_ms =
                u64::try_from(self.config.checkpoint_interval.as_millis()).unwrap_or(u64::MAX),
            "starting ingestion"
        );

        self.source.start()?;
        let scheduler = CheckpointScheduler::spawn(
            Arc::clone(&self.checkpoints),
            self.cursor.clone(),
            self.config.checkpoint_interval,
            Arc::clone(&self.stats),
        );

        tokio::pin!(shutdown);
        let outcome = loop {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    info!("shutdown requested");
                    break Ok(());
                }

                event = self.source.next_event() => {
                    let Some(event) = event else {
                        warn!("firehose source ended");
                        break Ok(());
                    };
                    if let Some(attempts) = self.handle_source_event(event).await {
                        break Err(IngestError::ReconnectExhausted { attempts });
                    }
                }
            }
        };

        self.source.stop().await;
        scheduler.cancel().await;
        if let Some(seq) = self.cursor.get() {
            save_checkpoint(self.checkpoints.as_ref(), seq, &self.stats).await;
        }

        let summary = self.stats().stats();
        info!(
            cursor = ?summary.cursor,
            commits = summary.counters.commits,
            events = summary.counters.events,
            errors = summary.counters.errors,
            decode_errors = summary.counters.decode_errors,
            "ingestion stopped"
        );
        outcome
    }

    async fn resolve_start_cursor(&self) -> Result<(), IngestError> {
        let persisted = self.checkpoints.load().await;
        match (self.config.source.cursor, persisted) {
            (Some(explicit), persisted) => {
                if let Err(e) = &persisted {
                    warn!(error = %e, "ignoring unreadable checkpoint, explicit cursor set");
                }
                info!(
                    cursor = explicit,
                    persisted = ?persisted.ok().flatten(),
                    "using explicit cursor"
                );
            }
            (None, Ok(Some(seq))) => {
                self.cursor.advance(seq);
                info!(cursor = seq, "resuming from checkpoint");
            }
            (None, Ok(None)) => info!("no checkpoint, starting from the live stream"),
            (None, Err(e)) => {
                error!(error = %e, "cannot read checkpoint");
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Handles one source event. Returns `Some(attempts)` when the source
    /// has given up.
    async fn handle_source_event(&mut self, event: SourceEvent) -> Option<u32> {
        match event {
            SourceEvent::Connected { url } => {
                info!(url = %url, "subscribed to relay");
                self.last_seq = None;
            }
            SourceEvent::Disconnected { reason } => {
                warn!(reason = %reason, cursor = ?self.cursor.get(), "relay disconnected");
            }
            SourceEvent::Error { message } => {
                self.stats.record_transport_error();
                debug!(error = %message, "transport error");
            }
            SourceEvent::Exhausted { attempts } => {
                error!(attempts, "reconnect attempts exhausted, stopping ingestion");
                return Some(attempts);
            }
            SourceEvent::Message(message) => self.handle_message(message).await,
        }
        None
    }

    async fn handle_message(&mut self, message: FirehoseMessage) {
        match message {
            FirehoseMessage::Commit(commit) => self.process_commit(&commit).await,
            FirehoseMessage::Info { name, message } => {
                info!(name = %name, message = ?message, "relay info");
            }
            FirehoseMessage::Error { error, message } => {
                warn!(error = %error, message = ?message, "relay error frame");
            }
            FirehoseMessage::Other { kind, seq } => {
                debug!(kind = %kind, seq = ?seq, "skipping message");
                if let Some(seq) = seq {
                    self.cursor.advance(seq);
                }
            }
        }
    }

    async fn process_commit(&mut self, commit: &Commit) {
        if let Some(prev) = self.last_seq {
            if commit.seq <= prev {
                self.stats.record_sequence_regression();
                warn!(
                    seq = commit.seq,
                    previous = prev,
                    repo = %commit.repo,
                    "sequence did not increase"
                );
            }
        }
        self.last_seq = Some(commit.seq);

        for event in self.router.route(commit) {
            let Some(handler) = self.handlers.get(&event.collection) else {
                self.stats.record_unhandled(&event);
                continue;
            };

            match handler.handle(&event).await {
                Ok(outcome) => self.stats.record_handled(&event, outcome),
                Err(e) => {
                    self.stats.record_handler_error(&event, e.category());
                    error!(
                        uri = %event.uri,
                        action = %event.action,
                        seq = event.seq,
                        category = e.category(),
                        error = %e,
                        "record handler failed"
                    );
                }
            }
        }

        self.stats.record_commit(commit.seq, commit.time);
        self.cursor.advance(commit.seq);
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("source", &self.source)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use canopy_connectors::firehose::{OpAction, RepoOp};
    use canopy_storage::{MemoryCheckpointStore, MemoryRecordStore};
    use chrono::Utc;

    use super::*;
    use crate::event::DomainEvent;
    use crate::handler::{HandlerError, HandlerOutcome, StoreHandler};

    struct Rejecting;

    #[async_trait]
    impl RecordHandler for Rejecting {
        async fn handle(&self, _event: &DomainEvent) -> Result<HandlerOutcome, HandlerError> {
            Err(HandlerError::Handler("rejected".into()))
        }
    }

    fn config() -> IngestConfig {
        let mut config = IngestConfig::new("ws://127.0.0.1:9");
        config.collections = vec!["org.example.occurrence".into(), "org.example.comment".into()];
        config.source.reconnect.max_attempts = 0;
        config.source.connect_timeout = Duration::from_millis(200);
        config
    }

    fn commit(seq: u64, ops: Vec<RepoOp>) -> Commit {
        Commit {
            repo: "did:example:1".into(),
            ops,
            seq,
            time: Utc::now(),
            blocks: None,
            rev: None,
            too_big: false,
            rebase: false,
        }
    }

    fn delete(path: &str) -> RepoOp {
        RepoOp {
            action: OpAction::Delete,
            path: path.into(),
            cid: None,
        }
    }

    #[test]
    fn test_register_rejects_unknown_and_duplicate() {
        let mut orch = Orchestrator::new(config(), Arc::new(MemoryCheckpointStore::new()));
        let handler = Arc::new(StoreHandler::new(Arc::new(MemoryRecordStore::new())));

        orch.register_handler("org.example.comment", handler.clone())
            .unwrap();
        assert!(matches!(
            orch.register_handler("org.example.comment", handler.clone()),
            Err(IngestError::DuplicateHandler(_))
        ));
        assert!(matches!(
            orch.register_handler("org.example.like", handler),
            Err(IngestError::UnknownCollection(_))
        ));
    }

    #[tokio::test]
    async fn test_cursor_advances_despite_handler_errors() {
        let mut orch = Orchestrator::new(config(), Arc::new(MemoryCheckpointStore::new()));
        orch.register_handler("org.example.comment", Arc::new(Rejecting))
            .unwrap();

        orch.process_commit(&commit(5, vec![delete("org.example.comment/a")]))
            .await;
        orch.process_commit(&commit(6, vec![delete("org.example.like/b")]))
            .await;

        assert_eq!(orch.cursor(), Some(6));
        let snap = orch.stats().stats();
        assert_eq!(snap.counters.commits, 2);
        assert_eq!(snap.counters.errors_by_category["handler"], 1);
        assert_eq!(snap.recent_events[0].outcome, "error");
        assert_eq!(snap.last_processed.unwrap().seq, 6);
    }

    #[tokio::test]
    async fn test_sequence_regression_counted() {
        let mut orch = Orchestrator::new(config(), Arc::new(MemoryCheckpointStore::new()));
        orch.process_commit(&commit(10, Vec::new())).await;
        orch.process_commit(&commit(9, Vec::new())).await;

        assert_eq!(orch.stats().stats().counters.sequence_regressions, 1);
        // The cursor never moves backwards.
        assert_eq!(orch.cursor(), Some(10));
    }

    #[tokio::test]
    async fn test_other_messages_advance_cursor() {
        let mut orch = Orchestrator::new(config(), Arc::new(MemoryCheckpointStore::new()));
        orch.handle_message(FirehoseMessage::Other {
            kind: "#identity".into(),
            seq: Some(77),
        })
        .await;
        orch.handle_message(FirehoseMessage::Info {
            name: "OutdatedCursor".into(),
            message: None,
        })
        .await;
        assert_eq!(orch.cursor(), Some(77));
    }

    #[tokio::test]
    async fn test_explicit_cursor_beats_checkpoint() {
        let mut cfg = config();
        cfg.source.cursor = Some(3);
        let orch = Orchestrator::new(cfg, Arc::new(MemoryCheckpointStore::with_initial(50)));
        orch.resolve_start_cursor().await.unwrap();
        assert_eq!(orch.cursor(), Some(3));

        let orch = Orchestrator::new(config(), Arc::new(MemoryCheckpointStore::with_initial(50)));
        orch.resolve_start_cursor().await.unwrap();
        assert_eq!(orch.cursor(), Some(50));
    }

    #[tokio::test]
    async fn test_run_exhausted_still_saves() {
        let store = Arc::new(MemoryCheckpointStore::with_initial(12));
        let orch = Orchestrator::new(config(), Arc::clone(&store) as Arc<dyn CheckpointStore>);

        let result = orch.run(std::future::pending()).await;
        assert!(matches!(
            result,
            Err(IngestError::ReconnectExhausted { attempts: 0 })
        ));
        assert_eq!(store.saves(), vec![12]);
    }
}
