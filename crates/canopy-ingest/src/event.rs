//! Domain events handed to record handlers.

use canopy_connectors::firehose::OpAction;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Builds the canonical URI of a record.
///
/// The URI depends only on its inputs, so every delivery of the same
/// record maps to the same key.
#[must_use]
pub fn record_uri(repo: &str, collection: &str, rkey: &str) -> String {
    format!("at://{repo}/{collection}/{rkey}")
}

/// Splits an operation path into `(collection, record_key)`.
///
/// Returns `None` unless the path is exactly two non-empty segments.
#[must_use]
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    let (collection, rkey) = path.split_once('/')?;
    if collection.is_empty() || rkey.is_empty() || rkey.contains('/') {
        return None;
    }
    Some((collection, rkey))
}

/// One routed record mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    /// Repository that owns the record.
    pub repo: String,
    /// `at://{repo}/{collection}/{rkey}`.
    pub uri: String,
    /// Record collection.
    pub collection: String,
    /// Record key.
    pub rkey: String,
    /// Content identifier of the new version; absent for deletes.
    pub cid: Option<String>,
    /// What happened to the record.
    pub action: OpAction,
    /// Decoded record body. Best effort: absent for deletes and whenever
    /// extraction from the commit blocks failed.
    pub record: Option<serde_json::Value>,
    /// Sequence number of the carrying commit.
    pub seq: u64,
    /// Time the relay emitted the carrying commit.
    pub time: DateTime<Utc>,
}
