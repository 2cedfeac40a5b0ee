//! Relay firehose connector.
//!
//! Subscribes to a relay's repository commit stream over a WebSocket and
//! turns each binary frame into a typed [`FirehoseMessage`].
//!
//! # Delivery Guarantees
//!
//! The relay retains history and accepts a `cursor` query parameter, so the
//! stream is replayable: after a reconnect the subscription resumes at or
//! after the last observed sequence number. Delivery is **at-least-once**;
//! consumers must apply commits idempotently.
//!
//! # Architecture
//!
//! ```text
//! reader task (tokio)                         consumer
//!   WebSocket ─► FrameDecoder ─► SourceEvent ─► mpsc (bounded) ─► next_event()
//!        ▲                                                           │
//!        └──────── ConnectionManager (backoff) ◄── SharedCursor ◄────┘
//! ```
//!
//! The bounded channel is the backpressure point: a slow consumer stalls
//! the socket reader instead of buffering without limit.

pub mod car;
pub mod cbor;
pub mod cid;
pub mod commit;
pub mod connection;
pub mod cursor;
pub mod frame;
pub mod metrics;
pub mod source;
pub mod source_config;

pub use car::BlockIndex;
pub use cbor::{CborError, DecodeLimits, Value};
pub use cid::Cid;
pub use commit::{Commit, OpAction, RepoOp};
pub use connection::{ConnectionManager, ConnectionState};
pub use cursor::SharedCursor;
pub use frame::{FirehoseMessage, FrameDecoder, FrameError, RawFrame};
pub use metrics::{FirehoseMetricsSnapshot, FirehoseSourceMetrics};
pub use source::{FirehoseSource, SourceEvent};
pub use source_config::{FirehoseSourceConfig, ReconnectConfig};
