//! # Canopy Storage
//!
//! Durability seams for the Canopy ingestion engine: where the stream
//! cursor is checkpointed, and where routed records are materialized.
//! Both are traits so the engine never depends on a particular database.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Cursor checkpoint persistence.
pub mod checkpoint;

/// Materialized record storage keyed by record URI.
pub mod records;

pub use checkpoint::{
    CheckpointError, CheckpointRecord, CheckpointStore, FileCheckpointStore,
    MemoryCheckpointStore,
};
pub use records::{MemoryRecordStore, RecordStore, StoreError, StoredRecord};
