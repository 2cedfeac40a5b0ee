//! Firehose source connector.
//!
//! [`FirehoseSource`] owns a background reader task that keeps one
//! WebSocket subscription open, decodes every binary frame, and hands the
//! results to the consumer as [`SourceEvent`]s over a bounded channel.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::ConnectorError;

use super::cbor::DecodeLimits;
use super::connection::{ConnectionManager, ConnectionState};
use super::cursor::SharedCursor;
use super::frame::{FirehoseMessage, FrameDecoder};
use super::metrics::{FirehoseMetricsSnapshot, FirehoseSourceMetrics};
use super::source_config::FirehoseSourceConfig;

/// How long [`FirehoseSource::stop`] waits for the reader task.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Something the reader task observed.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// A subscription was established.
    Connected {
        /// The URL used, including any `cursor` parameter.
        url: String,
    },
    /// The subscription ended without a stop request.
    Disconnected {
        /// Why the connection ended.
        reason: String,
    },
    /// A connect attempt failed or the transport reported an error.
    Error {
        /// Error detail.
        message: String,
    },
    /// Reconnect attempts are used up. Sent once; no events follow.
    Exhausted {
        /// Consecutive attempts made before giving up.
        attempts: u32,
    },
    /// A decoded frame.
    Message(FirehoseMessage),
}

/// Relay firehose source.
///
/// Call [`start`](Self::start) once, then drain [`next_event`](Self::next_event)
/// until it returns `None` or an [`SourceEvent::Exhausted`] arrives.
/// The consumer advances the shared cursor after it has durably applied
/// each message; reconnects resume from that cursor.
pub struct FirehoseSource {
    config: FirehoseSourceConfig,
    cursor: SharedCursor,
    metrics: Arc<FirehoseSourceMetrics>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    rx: Option<mpsc::Receiver<SourceEvent>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    reader_handle: Option<JoinHandle<()>>,
}

impl FirehoseSource {
    /// Creates a stopped source that will resume from `cursor`.
    #[must_use]
    pub fn new(config: FirehoseSourceConfig, cursor: SharedCursor) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            cursor,
            metrics: Arc::new(FirehoseSourceMetrics::new()),
            state_tx: Arc::new(state_tx),
            rx: None,
            shutdown_tx: None,
            reader_handle: None,
        }
    }

    /// Returns the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Returns a receiver that observes every state transition.
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Returns the cursor shared with the reader task.
    #[must_use]
    pub fn cursor(&self) -> &SharedCursor {
        &self.cursor
    }

    /// Returns a snapshot of the reader's counters.
    #[must_use]
    pub fn metrics(&self) -> FirehoseMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Returns the live counters, for readers outside the consumer path.
    #[must_use]
    pub fn metrics_handle(&self) -> Arc<FirehoseSourceMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Returns whether a reader task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.reader_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Spawns the reader task. A no-op if one is already running.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ConfigurationError` if the configuration
    /// cannot produce a subscription URL.
    pub fn start(&mut self) -> Result<(), ConnectorError> {
        if self.is_running() {
            debug!("firehose source already running");
            return Ok(());
        }
        self.config.validate()?;

        info!(
            relay = %self.config.relay_url,
            cursor = ?self.cursor.get(),
            "starting firehose source"
        );

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reader = Reader {
            config: self.config.clone(),
            cursor: self.cursor.clone(),
            metrics: Arc::clone(&self.metrics),
            state_tx: Arc::clone(&self.state_tx),
            decoder: FrameDecoder::new(DecodeLimits {
                max_depth: self.config.max_depth,
            }),
            tx,
        };

        self.rx = Some(rx);
        self.shutdown_tx = Some(shutdown_tx);
        self.reader_handle = Some(tokio::spawn(reader.run(shutdown_rx)));
        Ok(())
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once the reader task has ended and every buffered
    /// event has been drained, or if the source was never started.
    pub async fn next_event(&mut self) -> Option<SourceEvent> {
        self.rx.as_mut()?.recv().await
    }

    /// Stops the reader, closing the socket and cancelling any pending
    /// reconnect. Idempotent.
    pub async fn stop(&mut self) {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return;
        };
        info!("stopping firehose source");
        let _ = shutdown_tx.send(true);

        if let Some(handle) = self.reader_handle.take() {
            if tokio::time::timeout(STOP_TIMEOUT, handle).await.is_err() {
                warn!("firehose reader did not stop within timeout");
            }
        }

        self.rx = None;
        self.state_tx.send_replace(ConnectionState::Stopped);
        info!("firehose source stopped");
    }
}

impl std::fmt::Debug for FirehoseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirehoseSource")
            .field("relay", &self.config.relay_url)
            .field("state", &self.state())
            .field("cursor", &self.cursor.get())
            .finish_non_exhaustive()
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How a read loop ended.
enum ReadOutcome {
    /// The connection closed; the string says why.
    Closed(String),
    /// The transport failed on a live connection.
    Failed(String),
    /// Stop was requested or the consumer went away.
    Shutdown,
}

/// State moved into the reader task.
struct Reader {
    config: FirehoseSourceConfig,
    cursor: SharedCursor,
    metrics: Arc<FirehoseSourceMetrics>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    decoder: FrameDecoder,
    tx: mpsc::Sender<SourceEvent>,
}

impl Reader {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut conn_mgr = ConnectionManager::new(self.config.reconnect.clone());

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let url = match self.config.subscribe_url(self.cursor.get()) {
                Ok(url) => url.to_string(),
                Err(e) => {
                    warn!(error = %e, "cannot build subscription url");
                    break;
                }
            };

            self.set_state(ConnectionState::Connecting);
            info!(url = %url, "connecting to relay");

            let connect = tokio::time::timeout(
                self.config.connect_timeout,
                tokio_tungstenite::connect_async(url.as_str()),
            );
            let attempt = tokio::select! {
                result = connect => result,
                _ = shutdown_rx.changed() => break,
            };

            let reason = match attempt {
                Ok(Ok((socket, _response))) => {
                    conn_mgr.reset();
                    self.metrics.record_connect();
                    self.set_state(ConnectionState::Connected);
                    info!(url = %url, "relay connection established");
                    if !self
                        .emit(SourceEvent::Connected { url: url.clone() }, &mut shutdown_rx)
                        .await
                    {
                        break;
                    }
                    match self.read_loop(socket, &url, &mut shutdown_rx).await {
                        ReadOutcome::Closed(reason) => reason,
                        ReadOutcome::Failed(message) => {
                            let event = SourceEvent::Error {
                                message: message.clone(),
                            };
                            if !self.emit(event, &mut shutdown_rx).await {
                                break;
                            }
                            message
                        }
                        ReadOutcome::Shutdown => break,
                    }
                }
                Ok(Err(e)) => {
                    warn!(url = %url, error = %e, "relay connection failed");
                    let message = format!("connect to {url} failed: {e}");
                    if !self
                        .emit(SourceEvent::Error { message: message.clone() }, &mut shutdown_rx)
                        .await
                    {
                        break;
                    }
                    message
                }
                Err(_) => {
                    warn!(url = %url, "relay connection timed out");
                    let message = format!("connect to {url} timed out");
                    if !self
                        .emit(SourceEvent::Error { message: message.clone() }, &mut shutdown_rx)
                        .await
                    {
                        break;
                    }
                    message
                }
            };

            self.set_state(ConnectionState::Disconnected);
            if !self
                .emit(SourceEvent::Disconnected { reason }, &mut shutdown_rx)
                .await
            {
                break;
            }

            if let Some(delay) = conn_mgr.next_backoff() {
                self.metrics.record_reconnect();
                self.set_state(ConnectionState::Reconnecting);
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => break,
                }
            } else {
                self.set_state(ConnectionState::Stopped);
                let attempts = conn_mgr.attempt();
                warn!(
                    attempts,
                    max_attempts = conn_mgr.max_attempts(),
                    "giving up on relay connection"
                );
                let _ = self
                    .emit(SourceEvent::Exhausted { attempts }, &mut shutdown_rx)
                    .await;
                break;
            }
        }

        self.set_state(ConnectionState::Stopped);
        debug!("firehose reader exited");
    }

    async fn read_loop(
        &self,
        socket: Socket,
        url: &str,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> ReadOutcome {
        let (mut write, mut read) = socket.split();
        let max = self.config.max_message_size;

        loop {
            let msg = tokio::select! {
                msg = read.next() => msg,
                _ = shutdown_rx.changed() => {
                    debug!("shutdown signal received in reader");
                    let _ = write.send(tungstenite::Message::Close(None)).await;
                    return ReadOutcome::Shutdown;
                }
            };

            match msg {
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    if data.len() > max {
                        warn!(size = data.len(), max, "frame exceeds max size, dropping");
                        self.metrics.record_oversized();
                        continue;
                    }
                    self.metrics.record_message(data.len() as u64);
                    let Some(message) = self.decoder.decode(&data) else {
                        self.metrics.record_decode_error();
                        continue;
                    };
                    if let FirehoseMessage::Error { error, message } = &message {
                        self.metrics.record_error_frame();
                        warn!(error = %error, message = ?message, "relay sent error frame");
                    }
                    if !self.emit(SourceEvent::Message(message), shutdown_rx).await {
                        let _ = write.send(tungstenite::Message::Close(None)).await;
                        return ReadOutcome::Shutdown;
                    }
                }
                Some(Ok(tungstenite::Message::Text(text))) => {
                    debug!(len = text.len(), "ignoring text frame");
                    self.metrics.record_text_frame();
                }
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    let _ = write.send(tungstenite::Message::Pong(data)).await;
                }
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    info!(url = %url, frame = ?frame, "relay sent Close frame");
                    return ReadOutcome::Closed(format!("closed by relay: {frame:?}"));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(url = %url, error = %e, "relay read error");
                    return ReadOutcome::Failed(format!("read error: {e}"));
                }
                None => {
                    info!(url = %url, "relay stream ended");
                    return ReadOutcome::Closed("stream ended".into());
                }
            }
        }
    }

    /// Sends an event to the consumer, giving up if stop is requested
    /// while the channel is full. Returns `false` if the reader should exit.
    async fn emit(&self, event: SourceEvent, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        if *shutdown_rx.borrow() {
            return false;
        }
        tokio::select! {
            sent = self.tx.send(event) => sent.is_ok(),
            _ = shutdown_rx.changed() => false,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "connection state changed");
        }
    }
}
