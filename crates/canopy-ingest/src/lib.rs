//! # Canopy Ingest
//!
//! The firehose ingestion engine. An [`Orchestrator`] subscribes to a
//! relay, routes each repository commit into [`DomainEvent`]s for the
//! recognized record collections, hands them to per-collection
//! [`RecordHandler`]s, and checkpoints the stream cursor so a restart
//! resumes where the last one stopped.
//!
//! Delivery is at-least-once. Handlers must be idempotent per record URI.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Periodic cursor checkpointing.
pub mod checkpoint_scheduler;

/// Engine configuration.
pub mod config;

/// Engine error types.
pub mod error;

/// Domain events and record URIs.
pub mod event;

/// Per-collection record handlers.
pub mod handler;

/// The ingestion orchestrator.
pub mod orchestrator;

/// Commit → domain event routing.
pub mod router;

/// Operational statistics and the health/stats surface.
pub mod stats;

pub use config::IngestConfig;
pub use error::IngestError;
pub use event::DomainEvent;
pub use handler::{HandlerError, HandlerOutcome, RecordHandler, SkipReason, StoreHandler};
pub use orchestrator::Orchestrator;
pub use router::CommitRouter;
pub use stats::{HealthSnapshot, HealthStatus, StatsHandle, StatsSnapshot};
