//! Firehose source connector configuration.
//!
//! [`FirehoseSourceConfig`] is built from a flat [`ConnectorConfig`] or
//! deserialized directly. Durations are carried as milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::ConnectorConfig;
use crate::error::ConnectorError;

// ---------------------------------------------------------------------------
// Serde helper: Duration as milliseconds
// ---------------------------------------------------------------------------

/// Serde helper that encodes a [`Duration`] as a `u64` millisecond count.
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes a duration as whole milliseconds.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    /// Deserializes a duration from whole milliseconds.
    ///
    /// # Errors
    ///
    /// Propagates deserializer errors.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Default subscription path appended to the relay URL.
fn default_subscribe_path() -> String {
    "subscribe".to_string()
}

/// Default maximum message size: 5 MiB.
const fn default_max_message_size() -> usize {
    5 * 1024 * 1024
}

/// Default reader → consumer channel capacity.
///
/// One slot keeps the reader at most a single frame ahead of the handler
/// currently running.
const fn default_channel_capacity() -> usize {
    1
}

/// Default maximum CBOR nesting depth.
const fn default_max_depth() -> usize {
    64
}

/// Default connect/handshake timeout: 30 seconds.
const fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Default number of consecutive reconnect attempts before giving up.
const fn default_max_attempts() -> u32 {
    10
}

/// Default base delay for exponential backoff: 1 second.
const fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

// ---------------------------------------------------------------------------
// FirehoseSourceConfig
// ---------------------------------------------------------------------------

/// Firehose source connector configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirehoseSourceConfig {
    /// Relay base URL (`ws://` or `wss://`).
    pub relay_url: String,

    /// Path segment appended to the relay URL to reach the stream.
    #[serde(default = "default_subscribe_path")]
    pub subscribe_path: String,

    /// Explicit starting cursor. Overrides any persisted checkpoint.
    #[serde(default)]
    pub cursor: Option<u64>,

    /// Reconnection policy.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Messages larger than this are dropped unread.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Capacity of the channel between the socket reader and the consumer.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Maximum CBOR nesting depth accepted in a frame.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Time allowed for the TCP connect and WebSocket handshake.
    #[serde(default = "default_connect_timeout", with = "duration_millis")]
    pub connect_timeout: Duration,
}

impl FirehoseSourceConfig {
    /// Creates a config for `relay_url` with defaults everywhere else.
    #[must_use]
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            subscribe_path: default_subscribe_path(),
            cursor: None,
            reconnect: ReconnectConfig::default(),
            max_message_size: default_max_message_size(),
            channel_capacity: default_channel_capacity(),
            max_depth: default_max_depth(),
            connect_timeout: default_connect_timeout(),
        }
    }

    /// Builds a [`FirehoseSourceConfig`] from a flat [`ConnectorConfig`].
    ///
    /// Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::MissingConfig` if `relay.url` is absent and
    /// `ConnectorError::ConfigurationError` for unparseable values.
    pub fn from_config(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        let relay_url = config.require("relay.url")?.to_string();
        let subscribe_path = config
            .get("subscribe.path")
            .map_or_else(default_subscribe_path, ToString::to_string);
        let cursor: Option<u64> = config.get_parsed("cursor")?;

        let max_attempts: u32 = config
            .get_parsed("reconnect.max.attempts")?
            .unwrap_or(default_max_attempts());
        let base_delay_ms: u64 = config
            .get_parsed("reconnect.base.delay.ms")?
            .unwrap_or(1_000);

        let max_message_size: usize = config
            .get_parsed("max.message.size")?
            .unwrap_or(default_max_message_size());
        let channel_capacity: usize = config
            .get_parsed("channel.capacity")?
            .unwrap_or(default_channel_capacity());
        let max_depth: usize = config
            .get_parsed("max.depth")?
            .unwrap_or(default_max_depth());
        let connect_timeout_ms: u64 = config
            .get_parsed("connect.timeout.ms")?
            .unwrap_or(30_000);

        let parsed = Self {
            relay_url,
            subscribe_path,
            cursor,
            reconnect: ReconnectConfig {
                max_attempts,
                base_delay: Duration::from_millis(base_delay_ms),
            },
            max_message_size,
            channel_capacity,
            max_depth,
            connect_timeout: Duration::from_millis(connect_timeout_ms),
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Checks values that would make the connector unusable.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ConfigurationError` describing the problem.
    pub fn validate(&self) -> Result<(), ConnectorError> {
        self.subscribe_url(None)?;
        if self.channel_capacity == 0 {
            return Err(ConnectorError::ConfigurationError(
                "channel.capacity must be at least 1".into(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(ConnectorError::ConfigurationError(
                "max.message.size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Builds the subscription URL, appending `cursor` when one is known.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ConfigurationError` if the relay URL does
    /// not parse or is not a `ws`/`wss` URL.
    pub fn subscribe_url(&self, cursor: Option<u64>) -> Result<Url, ConnectorError> {
        let base = Url::parse(&self.relay_url)?;
        if !matches!(base.scheme(), "ws" | "wss") {
            return Err(ConnectorError::ConfigurationError(format!(
                "relay url must use ws:// or wss://, got '{}'",
                base.scheme()
            )));
        }

        let mut url = base;
        let path = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            self.subscribe_path.trim_start_matches('/')
        );
        url.set_path(&path);
        url.set_query(None);
        if let Some(cursor) = cursor {
            url.query_pairs_mut()
                .append_pair("cursor", &cursor.to_string());
        }
        Ok(url)
    }
}

// ---------------------------------------------------------------------------
// ReconnectConfig
// ---------------------------------------------------------------------------

/// Exponential-backoff reconnection policy.
///
/// After an unexpected close the connector waits
/// `base_delay * 2^attempt` and tries again, up to `max_attempts`
/// consecutive failures. A successful connect resets the count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Consecutive reconnect attempts allowed before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first reconnect attempt.
    #[serde(default = "default_base_delay", with = "duration_millis")]
    pub base_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
        }
    }
}
