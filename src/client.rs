//! Public client facade.
//!
//! [`StreamClient`] hands out [`Subscription`] queues and forwards requests
//! to the background [`ConnectionManager`] task over an unbounded command
//! channel. Subscriptions may be registered before [`StreamClient::connect`];
//! they are sent once the first session becomes ready.

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::models::{Channel, ChannelType, OrderBook};
use crate::profile::ExchangeProfile;
use crate::subscription::{Subscription, SubscriptionHandle, Update, bounded};
use crate::websocket::{Command, ConnectionManager, ConnectionState};
use crate::{Result, TickmuxError};

/// Streaming market data client for one exchange endpoint.
pub struct StreamClient {
    config: ClientConfig,
    profile: Option<Box<dyn ExchangeProfile>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: Option<mpsc::UnboundedReceiver<Command>>,
    state_tx: Option<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    closed: bool,
}

impl StreamClient {
    #[must_use]
    pub fn new(config: ClientConfig, profile: Box<dyn ExchangeProfile>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            profile: Some(profile),
            cmd_tx,
            cmd_rx: Some(cmd_rx),
            state_tx: Some(state_tx),
            state_rx,
            cancel: CancellationToken::new(),
            task: None,
            closed: false,
        }
    }

    /// Starts the background connection task.
    ///
    /// Calling it again while connected is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TickmuxError::Closed`] after [`close`](Self::close), or
    /// [`TickmuxError::Config`] when called outside a tokio runtime.
    pub fn connect(&mut self) -> Result<()> {
        if self.closed {
            return Err(TickmuxError::Closed);
        }
        if self.task.is_some() {
            debug!("connect called on a running client");
            return Ok(());
        }
        let runtime = runtime()?;
        let (Some(profile), Some(cmd_rx), Some(state_tx)) = (
            self.profile.take(),
            self.cmd_rx.take(),
            self.state_tx.take(),
        ) else {
            return Err(TickmuxError::Closed);
        };

        info!(
            url = self.config.endpoint(),
            profile = profile.name(),
            "Starting stream client"
        );
        let manager =
            ConnectionManager::new(&self.config, profile, cmd_rx, state_tx, self.cancel.clone());
        self.task = Some(runtime.spawn(manager.run()));
        Ok(())
    }

    /// Stops the connection task and ends every subscription.
    ///
    /// Idempotent. A closed client cannot be reconnected.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancel.cancel();
        match self.task.take() {
            Some(task) => {
                if let Err(e) = task.await {
                    warn!(error = %e, "Connection task ended abnormally");
                }
            }
            None => {
                // Never connected: dropping the queued commands ends their streams.
                self.cmd_rx = None;
                self.profile = None;
                if let Some(state_tx) = self.state_tx.take() {
                    state_tx.send_replace(ConnectionState::Closed);
                }
            }
        }
        info!("Stream client closed");
    }

    /// Subscribes to a symbol-scoped channel.
    ///
    /// # Errors
    ///
    /// Returns [`TickmuxError::Closed`] if the client has been closed.
    pub fn watch(&self, kind: ChannelType, symbol: &str) -> Result<Subscription> {
        self.watch_channel(Channel::new(kind, symbol))
    }

    /// Subscribes to any channel, including account-wide private ones.
    ///
    /// # Errors
    ///
    /// Returns [`TickmuxError::Closed`] if the client has been closed.
    pub fn watch_channel(&self, channel: Channel) -> Result<Subscription> {
        if self.closed {
            return Err(TickmuxError::Closed);
        }
        let (sink, subscription) = bounded(
            SubscriptionHandle::next(),
            channel.clone(),
            self.config.queue_capacity,
        );
        debug!(%channel, handle = %subscription.handle(), "Watching channel");
        self.send(Command::Subscribe { channel, sink })?;
        Ok(subscription)
    }

    /// Subscribes and feeds every update to `callback` on a separate task.
    ///
    /// The task ends after a failure update or when the subscription is
    /// removed with [`unwatch`](Self::unwatch).
    ///
    /// # Errors
    ///
    /// Returns [`TickmuxError::Closed`] if the client has been closed, or
    /// [`TickmuxError::Config`] when called outside a tokio runtime.
    pub fn watch_with<F>(&self, channel: Channel, mut callback: F) -> Result<SubscriptionHandle>
    where
        F: FnMut(Update) + Send + 'static,
    {
        let runtime = runtime()?;
        let mut subscription = self.watch_channel(channel)?;
        let handle = subscription.handle();
        runtime.spawn(async move {
            while let Some(update) = subscription.recv().await {
                let failed = matches!(update, Update::Failed(_));
                callback(update);
                if failed {
                    break;
                }
            }
            debug!(%handle, "Callback subscription finished");
        });
        Ok(handle)
    }

    /// Removes one handler; the channel is unsubscribed when none remain.
    ///
    /// Accepts either a [`SubscriptionHandle`] or a `&Subscription`.
    ///
    /// # Errors
    ///
    /// Returns [`TickmuxError::Closed`] if the client has been closed.
    pub fn unwatch(&self, subscription: impl Into<SubscriptionHandle>) -> Result<()> {
        if self.closed {
            return Err(TickmuxError::Closed);
        }
        self.send(Command::Unsubscribe {
            handle: subscription.into(),
        })
    }

    /// Returns a copy of the current order book for `symbol`.
    ///
    /// `Ok(None)` means no snapshot has arrived yet (or nothing watches the
    /// symbol).
    ///
    /// # Errors
    ///
    /// Returns [`TickmuxError::NotConnected`] before [`connect`](Self::connect)
    /// and [`TickmuxError::Closed`] after [`close`](Self::close).
    pub async fn order_book(&self, symbol: &str) -> Result<Option<OrderBook>> {
        if self.closed {
            return Err(TickmuxError::Closed);
        }
        if self.task.is_none() {
            return Err(TickmuxError::NotConnected);
        }
        let (reply, response) = oneshot::channel();
        self.send(Command::OrderBook {
            symbol: symbol.to_string(),
            reply,
        })?;
        response.await.map_err(|_| TickmuxError::Closed)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// A receiver that observes every connection state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.cmd_tx.send(command).map_err(|_| TickmuxError::Closed)
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn runtime() -> Result<Handle> {
    Handle::try_current()
        .map_err(|e| TickmuxError::Config(format!("a tokio runtime is required: {e}")))
}
