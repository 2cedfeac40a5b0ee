//! Materialized record storage.
//!
//! Handlers write routed events through [`RecordStore`]. Every operation is
//! keyed by the record URI, which makes replays after a reconnect harmless:
//! upserting the same URI twice or deleting an absent one changes nothing.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Errors from record store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend is unreachable or refused the write.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The record failed backend validation.
    #[error("invalid record {uri}: {reason}")]
    InvalidRecord {
        /// Record URI.
        uri: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// One materialized record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    /// `at://{repo}/{collection}/{rkey}`.
    pub uri: String,
    /// Owning repository.
    pub repo: String,
    /// Record collection.
    pub collection: String,
    /// Record key within the collection.
    pub rkey: String,
    /// Content identifier of this version, when known.
    pub cid: Option<String>,
    /// Decoded record body.
    pub record: serde_json::Value,
    /// Stream sequence number of the commit that produced this version.
    pub seq: u64,
    /// When the record was written to the store.
    pub indexed_at: DateTime<Utc>,
}

/// Async trait for the downstream record store.
///
/// Implementations must be idempotent per URI.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts or replaces the record at `record.uri`.
    async fn upsert(&self, record: StoredRecord) -> Result<(), StoreError>;

    /// Removes the record at `uri`. Returns whether one existed.
    async fn delete(&self, uri: &str) -> Result<bool, StoreError>;

    /// Fetches the record at `uri`.
    async fn get(&self, uri: &str) -> Result<Option<StoredRecord>, StoreError>;
}

/// In-memory [`RecordStore`].
///
/// An upsert carrying an older `seq` than the stored version is ignored, so
/// a replayed stream cannot roll a record back.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, StoredRecord>>,
}

impl MemoryRecordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns `true` if the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Copies out every record, sorted by URI.
    #[must_use]
    pub fn snapshot(&self) -> Vec<StoredRecord> {
        let mut all: Vec<_> = self.records.read().values().cloned().collect();
        all.sort_by(|a, b| a.uri.cmp(&b.uri));
        all
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert(&self, record: StoredRecord) -> Result<(), StoreError> {
        let mut records = self.records.write();
        match records.get(&record.uri) {
            Some(existing) if existing.seq > record.seq => {}
            _ => {
                records.insert(record.uri.clone(), record);
            }
        }
        Ok(())
    }

    async fn delete(&self, uri: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().remove(uri).is_some())
    }

    async fn get(&self, uri: &str) -> Result<Option<StoredRecord>, StoreError> {
        Ok(self.records.read().get(uri).cloned())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(rkey: &str, text: &str, seq: u64) -> StoredRecord {
        StoredRecord {
            uri: format!("at://did:example:1/org.example.comment/{rkey}"),
            repo: "did:example:1".into(),
            collection: "org.example.comment".into(),
            rkey: rkey.into(),
            cid: None,
            record: json!({ "text": text }),
            seq,
            indexed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces() {
        let store = MemoryRecordStore::new();
        store.upsert(record("a", "first", 1)).await.unwrap();
        store.upsert(record("a", "second", 2)).await.unwrap();

        assert_eq!(store.len(), 1);
        let got = store
            .get("at://did:example:1/org.example.comment/a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.record["text"], "second");
    }

    #[tokio::test]
    async fn test_older_version_ignored() {
        let store = MemoryRecordStore::new();
        store.upsert(record("a", "new", 10)).await.unwrap();
        store.upsert(record("a", "old", 3)).await.unwrap();

        let got = store.snapshot();
        assert_eq!(got[0].record["text"], "new");
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_an_error() {
        let store = MemoryRecordStore::new();
        store.upsert(record("a", "x", 1)).await.unwrap();

        assert!(store
            .delete("at://did:example:1/org.example.comment/a")
            .await
            .unwrap());
        assert!(!store
            .delete("at://did:example:1/org.example.comment/a")
            .await
            .unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_stored_record_serializes_camel_case() {
        let json = serde_json::to_value(record("a", "x", 1)).unwrap();
        assert!(json.get("indexedAt").is_some());
        assert_eq!(json["rkey"], "a");
    }
}
