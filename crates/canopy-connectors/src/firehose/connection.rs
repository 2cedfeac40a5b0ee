//! Firehose connection state and reconnection backoff.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::source_config::ReconnectConfig;

/// Lifecycle state of the firehose connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No socket is open and no attempt is scheduled.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// The socket is open and frames are flowing.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// Stopped on request or after exhausting reconnect attempts.
    Stopped,
}

impl ConnectionState {
    /// Returns the lowercase state name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks consecutive reconnect attempts and computes backoff delays.
///
/// The delay before attempt `n` (counting from zero) is
/// `base_delay * 2^n`. After `max_attempts` consecutive failures
/// [`next_backoff`](Self::next_backoff) returns `None` and the caller
/// must give up.
pub struct ConnectionManager {
    config: ReconnectConfig,
    attempt: u32,
}

impl ConnectionManager {
    /// Creates a manager with no attempts recorded.
    #[must_use]
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Returns the number of reconnect attempts scheduled since the last
    /// successful connect.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns the configured attempt ceiling.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Returns whether the attempt ceiling has been reached.
    #[must_use]
    pub fn max_attempts_exceeded(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }

    /// Resets the attempt count after a successful connection.
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!(
                previous_attempts = self.attempt,
                "connection established, reset backoff"
            );
        }
        self.attempt = 0;
    }

    /// Computes the delay before the next attempt and records the attempt.
    ///
    /// Returns `None` once `max_attempts` consecutive attempts have been
    /// scheduled without an intervening [`reset`](Self::reset).
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.max_attempts_exceeded() {
            warn!(
                attempts = self.attempt,
                max = self.config.max_attempts,
                "max reconnection attempts exceeded"
            );
            return None;
        }

        let factor = 2u32.saturating_pow(self.attempt);
        let delay = self.config.base_delay.saturating_mul(factor);
        self.attempt += 1;

        warn!(
            attempt = self.attempt,
            max = self.config.max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling reconnection attempt"
        );

        Some(delay)
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.config.max_attempts)
            .finish_non_exhaustive()
    }
}
