//! Commit routing.
//!
//! [`CommitRouter`] turns one decoded commit into zero or more
//! [`DomainEvent`]s, keeping only operations whose collection is in the
//! allow-list. Record bodies are pulled from the commit's CAR blocks on a
//! best-effort basis; any extraction failure leaves the record absent.

use std::collections::BTreeSet;

use canopy_connectors::firehose::{BlockIndex, Commit, DecodeLimits, OpAction};
use tracing::debug;

use crate::event::{record_uri, split_path, DomainEvent};

/// Routes commits to domain events for an allow-list of collections.
#[derive(Debug, Clone)]
pub struct CommitRouter {
    collections: BTreeSet<String>,
    limits: DecodeLimits,
}

impl CommitRouter {
    /// Creates a router for the given collections.
    pub fn new<I, S>(collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            collections: collections.into_iter().map(Into::into).collect(),
            limits: DecodeLimits::default(),
        }
    }

    /// Sets the limits used when decoding record blocks.
    #[must_use]
    pub fn with_limits(mut self, limits: DecodeLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Returns whether `collection` is routed.
    #[must_use]
    pub fn is_recognized(&self, collection: &str) -> bool {
        self.collections.contains(collection)
    }

    /// Routed collections, sorted.
    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.collections.iter().map(String::as_str)
    }

    /// Converts a commit into events, preserving operation order.
    ///
    /// Operations in other collections are skipped silently. Operations
    /// with an unparseable path are skipped with a debug log.
    #[must_use]
    pub fn route(&self, commit: &Commit) -> Vec<DomainEvent> {
        let mut blocks: Option<Option<BlockIndex<'_>>> = None;
        let mut events = Vec::new();

        for op in &commit.ops {
            let Some((collection, rkey)) = split_path(&op.path) else {
                debug!(
                    repo = %commit.repo,
                    path = %op.path,
                    seq = commit.seq,
                    "skipping op with unparseable path"
                );
                continue;
            };
            if !self.is_recognized(collection) {
                continue;
            }

            let record = match (op.action, &op.cid) {
                (OpAction::Delete, _) | (_, None) => None,
                (_, Some(cid)) => blocks
                    .get_or_insert_with(|| self.index_blocks(commit))
                    .as_ref()
                    .and_then(|index| index.decode_record(cid, &self.limits)),
            };

            events.push(DomainEvent {
                repo: commit.repo.clone(),
                uri: record_uri(&commit.repo, collection, rkey),
                collection: collection.to_string(),
                rkey: rkey.to_string(),
                cid: op.cid.as_ref().map(ToString::to_string),
                action: op.action,
                record,
                seq: commit.seq,
                time: commit.time,
            });
        }

        events
    }

    fn index_blocks<'c>(&self, commit: &'c Commit) -> Option<BlockIndex<'c>> {
        let car = commit.blocks.as_deref()?;
        match BlockIndex::parse(car, &self.limits) {
            Ok(index) => Some(index),
            Err(e) => {
                debug!(
                    repo = %commit.repo,
                    seq = commit.seq,
                    error = %e,
                    "commit blocks unreadable"
                );
                None
            }
        }
    }
}
