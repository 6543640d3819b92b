//! WebSocket connection lifecycle management.
//!
//! [`ConnectionManager`] owns the socket and the [`Router`]. It connects,
//! logs in, replays subscriptions, keeps the link alive with heartbeats and
//! reconnects with exponential backoff whenever the link drops, until its
//! cancellation token fires or every command sender is gone.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tungstenite::Message as WsMessage;

use super::{WsReader, WsWriter, connect, ping, send_all};
use crate::config::{BackoffPolicy, ClientConfig};
use crate::models::{Channel, OrderBook};
use crate::profile::ExchangeProfile;
use crate::router::Router;
use crate::subscription::{EventSink, SubscriptionHandle};

/// Requests from the client facade to the connection task.
pub enum Command {
    Subscribe { channel: Channel, sink: EventSink },
    Unsubscribe { handle: SubscriptionHandle },
    OrderBook {
        symbol: String,
        reply: oneshot::Sender<Option<OrderBook>>,
    },
}

/// Observable connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket open, session not started yet.
    Connected,
    /// Login sent, waiting for the acknowledgement.
    Authenticating,
    /// Subscriptions flow.
    Ready,
    /// The manager has stopped for good.
    Closed,
}

/// Why the session loop exited.
enum DisconnectReason {
    /// The connection was lost, errored or went silent.
    ConnectionError,
    /// Cancelled, or every command sender was dropped.
    Shutdown,
}

/// Drives one exchange connection until shutdown.
pub struct ConnectionManager {
    url: String,
    heartbeat_interval: Duration,
    max_missed_heartbeats: u32,
    backoff: BackoffPolicy,
    router: Router,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(
        config: &ClientConfig,
        profile: Box<dyn ExchangeProfile>,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            url: config.endpoint().to_string(),
            heartbeat_interval: config.heartbeat_interval,
            max_missed_heartbeats: config.max_missed_heartbeats.max(1),
            backoff: config.backoff,
            router: Router::new(
                profile,
                config.credentials.clone(),
                config.delta_buffer_limit,
            ),
            cmd_rx,
            state_tx,
            cancel,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "Connection state changed");
        }
    }

    fn handle_command(&mut self, command: Command) -> Vec<String> {
        match command {
            Command::Subscribe { channel, sink } => self.router.subscribe(channel, sink),
            Command::Unsubscribe { handle } => self.router.unsubscribe(handle),
            Command::OrderBook { symbol, reply } => {
                if reply.send(self.router.order_book(&symbol)).is_err() {
                    debug!(%symbol, "Order book requester went away");
                }
                Vec::new()
            }
        }
    }

    /// Runs the connection loop until cancelled.
    ///
    /// Backoff grows with each consecutive failure and starts over once a
    /// session has reached the ready state.
    pub async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 {
                let delay = self.backoff.delay(attempt - 1);
                info!(
                    attempt,
                    backoff_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Backing off before reconnect"
                );
                if !self.wait_backoff(delay).await {
                    break;
                }
            }

            self.set_state(ConnectionState::Connecting);
            info!(url = %self.url, "Connecting to WebSocket");
            let cancel = self.cancel.clone();
            let connected = tokio::select! {
                () = cancel.cancelled() => break,
                result = connect(&self.url) => result,
            };
            let (mut write, read) = match connected {
                Ok(pair) => pair,
                Err(e) => {
                    error!(url = %self.url, error = %e, "Connection failed");
                    self.set_state(ConnectionState::Disconnected);
                    attempt = attempt.saturating_add(1);
                    continue;
                }
            };
            self.set_state(ConnectionState::Connected);

            let reason = self.session(&mut write, read).await;
            let reached_ready = self.router.is_ready();
            self.router.on_disconnected();

            match reason {
                DisconnectReason::ConnectionError => {
                    self.set_state(ConnectionState::Disconnected);
                    attempt = if reached_ready {
                        1
                    } else {
                        attempt.saturating_add(1)
                    };
                    info!(attempt, "Connection lost");
                }
                DisconnectReason::Shutdown => {
                    if let Err(e) = write.close().await {
                        debug!(error = %e, "Close handshake failed");
                    }
                    break;
                }
            }
        }

        self.set_state(ConnectionState::Closed);
        info!("Connection manager shutting down");
    }

    /// Sleeps for `delay` while still accepting commands.
    ///
    /// Returns `false` if shutdown was requested meanwhile.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let cancel = self.cancel.clone();
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return false,
                () = &mut sleep => return true,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        // Nothing is on the wire while disconnected.
                        let frames = self.handle_command(cmd);
                        if !frames.is_empty() {
                            debug!(count = frames.len(), "Discarding frames while disconnected");
                        }
                    }
                    None => return false,
                },
            }
        }
    }

    /// Runs one connected session until the socket drops or shutdown.
    async fn session(&mut self, write: &mut WsWriter, mut read: WsReader) -> DisconnectReason {
        let frames = self.router.on_connected();
        let mut ready = self.router.is_ready();
        self.set_state(if ready {
            ConnectionState::Ready
        } else {
            ConnectionState::Authenticating
        });
        if let Err(e) = send_all(write, frames).await {
            warn!(error = %e, "Failed to start session");
            return DisconnectReason::ConnectionError;
        }

        let cancel = self.cancel.clone();
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut missed: u32 = 0;
        let mut auth_ticks: u32 = 0;

        loop {
            let frames = tokio::select! {
                () = cancel.cancelled() => return DisconnectReason::Shutdown,

                msg = read.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        missed = 0;
                        self.router.handle_text(text.as_str())
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(?frame, "Server closed connection");
                        return DisconnectReason::ConnectionError;
                    }
                    // Binary, ping and pong frames still prove liveness.
                    Some(Ok(_)) => {
                        missed = 0;
                        Vec::new()
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        return DisconnectReason::ConnectionError;
                    }
                    None => {
                        warn!("WebSocket stream ended");
                        return DisconnectReason::ConnectionError;
                    }
                },

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => return DisconnectReason::Shutdown,
                },

                _ = heartbeat.tick() => {
                    if missed >= self.max_missed_heartbeats {
                        warn!(missed, "Heartbeat timeout, reconnecting");
                        return DisconnectReason::ConnectionError;
                    }
                    missed += 1;

                    let mut frames = Vec::new();
                    if self.router.is_authenticating() {
                        auth_ticks += 1;
                        if auth_ticks >= self.max_missed_heartbeats {
                            warn!("Login not acknowledged in time");
                            frames.extend(self.router.abandon_auth("login timed out"));
                        }
                    }
                    match self.router.ping_frame() {
                        Some(frame) => frames.push(frame),
                        None => {
                            if let Err(e) = ping(write).await {
                                warn!(error = %e, "Ping failed");
                                return DisconnectReason::ConnectionError;
                            }
                        }
                    }
                    frames
                }
            };

            if !ready && self.router.is_ready() {
                ready = true;
                self.set_state(ConnectionState::Ready);
            }
            if let Err(e) = send_all(write, frames).await {
                warn!(error = %e, "Write failed");
                return DisconnectReason::ConnectionError;
            }
        }
    }
}
