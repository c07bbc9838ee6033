//! Push channel with auto-reconnect
//!
//! Holds the WebSocket connection to the dashboard backend's Socket.IO
//! endpoint and hands parsed [`PushEvent`]s to a single message handler.
//!
//! ```text
//! push_loop ── connect ── read frames ──► mpsc ──► pump task ──► handler
//!     ▲                        │
//!     └── backoff ◄── error ───┘
//! ```
//!
//! Connection state is published through a `watch` channel: `Unknown`
//! until the first attempt, `Connecting` while (re)connecting, `Connected`
//! once the upgrade succeeds.

use futures_util::{SinkExt, StreamExt};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::error::TransportError;
use super::event::PushEvent;
use super::ConnectionState;
use crate::config::PushConfig;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Engine.IO heartbeat frames
const PING_FRAME: &str = "2";
const PONG_FRAME: &str = "3";

/// Exponential backoff configuration for reconnection
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Reconnection attempts before giving up; `None` retries forever
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

impl ReconnectConfig {
    /// `min(initial * 2^attempt, max)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Handle to a running push connection
///
/// Dropping the handle or calling [`shutdown`](Self::shutdown) stops the
/// connection loop and the message pump.
pub struct PushChannel {
    state: watch::Receiver<ConnectionState>,
    events: Mutex<Option<mpsc::Receiver<PushEvent>>>,
    cancel: CancellationToken,
}

impl PushChannel {
    /// Spawn the connection loop
    ///
    /// Returns immediately; the first attempt happens in the background.
    /// Cancelling `cancel` shuts the channel down.
    pub fn connect(config: &PushConfig, cancel: CancellationToken) -> Self {
        Self::connect_url(&config.url, config.reconnect(), cancel)
    }

    pub fn connect_url(url: &str, reconnect: ReconnectConfig, cancel: CancellationToken) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Unknown);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = cancel.child_token();

        let url = url.to_string();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            push_loop(url, event_tx, state_tx, reconnect, task_cancel).await;
        });

        Self::from_parts(event_rx, state_rx, cancel)
    }

    fn from_parts(
        events: mpsc::Receiver<PushEvent>,
        state: watch::Receiver<ConnectionState>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state,
            events: Mutex::new(Some(events)),
            cancel,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Attach the message handler
    ///
    /// Spawns one pump task that calls `handler` for each event, one at a
    /// time and in arrival order. Only one handler can be attached.
    pub fn on_message<F>(&self, mut handler: F) -> Result<JoinHandle<()>, TransportError>
    where
        F: FnMut(PushEvent) + Send + 'static,
    {
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransportError::HandlerAttached)?;

        let cancel = self.cancel.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => handler(event),
                        None => break,
                    },
                }
            }
            tracing::debug!("Push message pump exiting");
        }))
    }

    /// Signal the connection loop and pump to stop
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Connect, read until the connection drops, back off, reconnect
async fn push_loop(
    url: String,
    event_tx: mpsc::Sender<PushEvent>,
    state_tx: watch::Sender<ConnectionState>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        state_tx.send_replace(ConnectionState::Connecting);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = connect_and_read(&url, &event_tx, &state_tx, &cancel) => result,
        };

        if event_tx.is_closed() {
            break;
        }

        let delay = match result {
            Ok(()) => {
                tracing::info!("Push channel disconnected, reconnecting");
                attempt = 0;
                reconnect.initial_delay
            }
            Err(e) => {
                state_tx.send_replace(ConnectionState::Connecting);
                tracing::warn!(error = %e, attempt, "Push channel error");

                if let Some(max) = reconnect.max_retries {
                    if attempt >= max {
                        tracing::error!(max_retries = max, "Push reconnection limit reached, giving up");
                        break;
                    }
                }
                let delay = reconnect.backoff(attempt);
                attempt += 1;
                delay
            }
        };

        tracing::info!(delay_ms = delay.as_millis() as u64, attempt, "Waiting before reconnect");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    state_tx.send_replace(ConnectionState::Unknown);
    tracing::debug!("Push loop exiting");
}

/// One connection lifecycle
async fn connect_and_read(
    url: &str,
    event_tx: &mpsc::Sender<PushEvent>,
    state_tx: &watch::Sender<ConnectionState>,
    cancel: &CancellationToken,
) -> Result<(), TransportError> {
    tracing::info!(url = %url, "Connecting to push channel");

    let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;

    state_tx.send_replace(ConnectionState::Connected);
    tracing::info!("Push channel connected");

    let (mut write, mut read) = ws_stream.split();

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            frame = read.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                if text.as_str() == PING_FRAME {
                    write
                        .send(Message::text(PONG_FRAME))
                        .await
                        .map_err(|e| TransportError::Read(e.to_string()))?;
                    continue;
                }

                match PushEvent::parse(&text) {
                    Ok(event) => {
                        if event_tx.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(TransportError::UnknownEvent(name)) => {
                        tracing::debug!(event = %name, "Ignoring push event");
                    }
                    Err(e) => {
                        tracing::trace!(error = %e, "Skipping push frame");
                    }
                }
            }
            Some(Ok(Message::Close(frame))) => {
                match frame {
                    Some(cf) => tracing::info!(code = %cf.code, reason = %cf.reason, "Push channel closed by server"),
                    None => tracing::info!("Push channel closed by server"),
                }
                return Ok(());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(TransportError::Read(e.to_string())),
            None => {
                tracing::info!("Push stream ended");
                return Ok(());
            }
        }
    }
}
