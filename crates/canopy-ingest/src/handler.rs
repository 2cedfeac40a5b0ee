//! Per-collection record handlers.
//!
//! The orchestrator awaits one [`RecordHandler`] call per routed event
//! before touching the next frame. A handler error is counted and logged;
//! it never stops the pipeline and the event is not retried.

use std::sync::Arc;

use async_trait::async_trait;
use canopy_connectors::firehose::OpAction;
use canopy_storage::{RecordStore, StoreError, StoredRecord};
use chrono::Utc;
use tracing::debug;

use crate::event::DomainEvent;

/// Errors a handler may return.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The downstream store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The handler rejected or could not process the event.
    #[error("handler error: {0}")]
    Handler(String),
}

impl HandlerError {
    /// Short category name used as a counter key.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            HandlerError::Store(_) => "store",
            HandlerError::Handler(_) => "handler",
        }
    }
}

/// What a handler did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The record was inserted or replaced.
    Upserted,
    /// A delete was applied. `existed` is `false` if the record was
    /// already gone.
    Deleted {
        /// Whether a record was removed.
        existed: bool,
    },
    /// The event was ignored.
    Skipped(SkipReason),
}

impl HandlerOutcome {
    /// Short name used in the recent-events buffer.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HandlerOutcome::Upserted => "upserted",
            HandlerOutcome::Deleted { .. } => "deleted",
            HandlerOutcome::Skipped(_) => "skipped",
        }
    }
}

/// Why an event was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A create/update arrived without a decodable record body.
    MissingRecord,
}

/// Applies domain events for one collection.
///
/// Implementations must be idempotent per URI: the same event may be
/// delivered more than once after a reconnect.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    /// Applies one event.
    async fn handle(&self, event: &DomainEvent) -> Result<HandlerOutcome, HandlerError>;
}

/// Handler that mirrors events into a [`RecordStore`].
///
/// `create` and `update` upsert by URI; `delete` removes by URI and is
/// not an error when nothing is there. Creates and updates whose record
/// body could not be extracted are skipped rather than written empty.
pub struct StoreHandler<S: ?Sized> {
    store: Arc<S>,
}

impl<S: RecordStore + ?Sized> StoreHandler<S> {
    /// Creates a handler writing to `store`.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: ?Sized> std::fmt::Debug for StoreHandler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl<S: RecordStore + ?Sized> RecordHandler for StoreHandler<S> {
    async fn handle(&self, event: &DomainEvent) -> Result<HandlerOutcome, HandlerError> {
        match event.action {
            OpAction::Create | OpAction::Update => {
                let Some(record) = event.record.clone() else {
                    debug!(uri = %event.uri, seq = event.seq, "no record body, skipping upsert");
                    return Ok(HandlerOutcome::Skipped(SkipReason::MissingRecord));
                };
                self.store
                    .upsert(StoredRecord {
                        uri: event.uri.clone(),
                        repo: event.repo.clone(),
                        collection: event.collection.clone(),
                        rkey: event.rkey.clone(),
                        cid: event.cid.clone(),
                        record,
                        seq: event.seq,
                        indexed_at: Utc::now(),
                    })
                    .await?;
                Ok(HandlerOutcome::Upserted)
            }
            OpAction::Delete => {
                let existed = self.store.delete(&event.uri).await?;
                Ok(HandlerOutcome::Deleted { existed })
            }
        }
    }
}
