//! # Canopy Connectors
//!
//! Inbound connectors for the Canopy ingestion engine. The only connector
//! today is the relay firehose: a single outbound WebSocket subscription
//! whose binary frames are decoded into repository commits.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Flat property-map configuration shared by all connectors.
pub mod config;

/// Connector error types.
pub mod error;

/// Relay firehose connector (transport, reconnection, wire decoding).
pub mod firehose;

pub use config::ConnectorConfig;
pub use error::ConnectorError;
