//! Error types for the ingestion engine.

use canopy_connectors::ConnectorError;
use canopy_storage::CheckpointError;

/// Errors that stop the engine or reject its setup.
///
/// Per-frame and per-event failures never surface here; they are counted
/// and logged, and the pipeline keeps going.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Connector configuration or lifecycle error.
    #[error("connector error: {0}")]
    Connector(#[from] ConnectorError),

    /// The checkpoint store could not be read at startup.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Invalid engine configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A handler was registered for a collection outside the allow-list.
    #[error("collection '{0}' is not in the allow-list")]
    UnknownCollection(String),

    /// A second handler was registered for the same collection.
    #[error("a handler is already registered for '{0}'")]
    DuplicateHandler(String),

    /// The source used up its reconnect attempts. Requires a restart.
    #[error("relay connection lost after {attempts} reconnect attempts")]
    ReconnectExhausted {
        /// Consecutive attempts made.
        attempts: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = IngestError::ReconnectExhausted { attempts: 10 };
        assert_eq!(
            err.to_string(),
            "relay connection lost after 10 reconnect attempts"
        );

        let err = IngestError::UnknownCollection("org.example.like".into());
        assert!(err.to_string().contains("org.example.like"));
    }

    #[test]
    fn test_from_connector_error() {
        let err: IngestError = ConnectorError::MissingConfig("relay.url".into()).into();
        assert!(matches!(err, IngestError::Connector(_)));
    }
}
