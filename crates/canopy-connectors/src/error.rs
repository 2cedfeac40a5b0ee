//! Error types for connector lifecycle and configuration.

use thiserror::Error;

/// Errors raised by connectors outside the per-frame decode path.
///
/// Frame decode failures never surface here: a malformed frame is dropped
/// and counted, and the connection keeps running.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// A required configuration key is missing.
    #[error("missing config: {0}")]
    MissingConfig(String),

    /// A configuration value is present but invalid.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// The connector was asked to do something its current state forbids.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// The state the operation requires.
        expected: String,
        /// The state the connector was actually in.
        actual: String,
    },

    /// The transport could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Reading from the transport failed.
    #[error("read error: {0}")]
    ReadError(String),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<url::ParseError> for ConnectorError {
    fn from(err: url::ParseError) -> Self {
        Self::ConfigurationError(format!("invalid url: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_invalid_state() {
        let err = ConnectorError::InvalidState {
            expected: "Stopped".into(),
            actual: "Connected".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid state: expected Stopped, got Connected"
        );
    }

    #[test]
    fn test_from_url_parse_error() {
        let err: ConnectorError = url::Url::parse("not a url").unwrap_err().into();
        assert!(matches!(err, ConnectorError::ConfigurationError(_)));
        assert!(err.to_string().contains("invalid url"));
    }
}
