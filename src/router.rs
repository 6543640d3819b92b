//! Inbound frame dispatch.
//!
//! The [`Router`] owns all per-connection protocol state (registry, order
//! books, subscriptions, auth session) and is driven by a single task, so
//! none of it needs locking. Every entry point returns the frames that must
//! be written to the socket in response; the router never touches the
//! socket itself.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::Result;
use crate::auth::{AuthSession, AuthState, Credentials};
use crate::book::{BookOutcome, OrderBookStore};
use crate::models::{Channel, ChannelId, ChannelType, MarketEvent, OrderBook};
use crate::profile::{ExchangeProfile, Payload, Resnapshot};
use crate::registry::{ChannelRegistry, IdStrategy};
use crate::subscription::{
    EventSink, Gate, StreamFailure, SubscriptionHandle, SubscriptionManager, SubscriptionState,
    Update,
};

/// Control frames handled by the router itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Server keepalive; `reply` is sent back if the exchange expects one.
    Ping { reply: Option<String> },
    Pong,
    Heartbeat,
    Subscribed {
        channel: Channel,
        id: Option<ChannelId>,
    },
    SubscribeRejected {
        channel: Option<Channel>,
        id: Option<ChannelId>,
        reason: String,
    },
    Unsubscribed { id: ChannelId },
    Info(String),
}

/// An inbound frame after classification by the exchange profile.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(Control),
    ChannelMessage { id: ChannelId, payload: Value },
    AuthAck {
        success: bool,
        message: Option<String>,
    },
    /// Exchange-level error not tied to a channel.
    Error(String),
    Unknown,
}

/// Protocol state machine for one logical client.
pub struct Router {
    profile: Box<dyn ExchangeProfile>,
    registry: ChannelRegistry,
    books: OrderBookStore,
    subscriptions: SubscriptionManager,
    credentials: Option<Credentials>,
    auth: Option<AuthSession>,
    ready: bool,
}

impl Router {
    #[must_use]
    pub fn new(
        profile: Box<dyn ExchangeProfile>,
        credentials: Option<Credentials>,
        delta_buffer_limit: usize,
    ) -> Self {
        Self {
            registry: ChannelRegistry::new(profile.id_strategy()),
            books: OrderBookStore::new(profile.sequence_policy(), delta_buffer_limit),
            subscriptions: SubscriptionManager::new(),
            profile,
            credentials,
            auth: None,
            ready: false,
        }
    }

    pub fn profile(&self) -> &dyn ExchangeProfile {
        self.profile.as_ref()
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn auth_state(&self) -> Option<AuthState> {
        self.auth.as_ref().map(AuthSession::state)
    }

    pub fn is_authenticating(&self) -> bool {
        self.auth_state() == Some(AuthState::Pending)
    }

    fn gate(&self) -> Gate {
        Gate {
            ready: self.ready,
            authenticated: self.auth_state() == Some(AuthState::Authenticated),
        }
    }

    /// Parses and classifies one raw text frame.
    ///
    /// # Errors
    ///
    /// Returns [`TickmuxError::Json`](crate::TickmuxError::Json) if the frame
    /// is not valid JSON.
    pub fn classify(&self, raw: &str) -> Result<Frame> {
        let value: Value = serde_json::from_str(raw)?;
        Ok(self.profile.classify(value))
    }

    /// Starts a session on a freshly opened socket.
    ///
    /// With credentials this returns the login frame and the router waits
    /// for the acknowledgement; otherwise it goes straight to ready and
    /// returns the replayed subscribe frames.
    pub fn on_connected(&mut self) -> Vec<String> {
        self.ready = false;
        let Some(credentials) = self.credentials.clone() else {
            return self.become_ready();
        };

        let mut session = AuthSession::new(credentials);
        let login = session
            .build_login_payload(&self.profile.auth_scheme())
            .and_then(|payload| self.profile.login_request(&payload));
        self.auth = Some(session);
        match login {
            Ok(frame) => {
                info!(profile = self.profile.name(), "Sending login request");
                vec![frame]
            }
            Err(e) => {
                warn!(error = %e, "Could not build login request");
                self.abandon_auth(&e.to_string())
            }
        }
    }

    /// Drops every piece of connection-scoped state.
    ///
    /// Subscriptions are kept and replayed on the next session; books stay
    /// readable until their next snapshot.
    pub fn on_disconnected(&mut self) {
        self.ready = false;
        self.auth = None;
        self.registry.clear();
        self.books.invalidate_all();
        self.subscriptions.reset();
    }

    /// Gives up on a pending login, failing private subscriptions.
    pub fn abandon_auth(&mut self, reason: &str) -> Vec<String> {
        if let Some(session) = self.auth.as_mut() {
            session.fail();
        }
        self.fail_private(reason);
        self.become_ready()
    }

    fn fail_private(&mut self, reason: &str) {
        for channel in self.subscriptions.fail_private(reason) {
            self.registry.unregister_channel(&channel);
        }
    }

    fn become_ready(&mut self) -> Vec<String> {
        if self.ready {
            return Vec::new();
        }
        self.ready = true;
        let channels = self.subscriptions.replay(self.gate());
        info!(count = channels.len(), "Session ready, replaying subscriptions");
        channels
            .iter()
            .filter_map(|channel| self.send_subscribe(channel))
            .collect()
    }

    fn send_subscribe(&mut self, channel: &Channel) -> Option<String> {
        let id = self.registry.register(channel);
        if id.is_none() && matches!(self.profile.id_strategy(), IdStrategy::Derived(_)) {
            self.subscriptions
                .on_reject(channel, "wire id already used by another channel");
            return None;
        }
        match self.profile.subscribe_request(channel) {
            Ok(frame) => {
                if !self.profile.acknowledges_subscribe() {
                    self.subscriptions.on_ack(channel);
                }
                debug!(%channel, "Sending subscribe request");
                Some(frame)
            }
            Err(e) => {
                warn!(%channel, error = %e, "Could not encode subscribe request");
                None
            }
        }
    }

    fn send_unsubscribe(&mut self, channel: &Channel) -> Vec<String> {
        let id = self.registry.id_of(channel).cloned();
        match self.profile.unsubscribe_request(channel, id.as_ref()) {
            Ok(Some(frame)) => {
                debug!(%channel, "Sending unsubscribe request");
                vec![frame]
            }
            Ok(None) => {
                debug!(%channel, "No channel id yet, unsubscribing after acknowledgement");
                Vec::new()
            }
            Err(e) => {
                warn!(%channel, error = %e, "Could not encode unsubscribe request");
                Vec::new()
            }
        }
    }

    /// Registers a handler and returns the frames to send, if any.
    pub fn subscribe(&mut self, channel: Channel, sink: EventSink) -> Vec<String> {
        let channel = self.profile.canonical_channel(channel);
        if channel.is_private() {
            let refusal = if self.credentials.is_none() {
                Some("no credentials configured")
            } else if self.ready && self.auth_state() == Some(AuthState::Failed) {
                Some("login was rejected")
            } else {
                None
            };
            if let Some(reason) = refusal {
                warn!(%channel, reason, "Refusing private subscription");
                sink.push(Update::Failed(StreamFailure::Authentication(
                    reason.to_string(),
                )));
                return Vec::new();
            }
        }

        match self.subscriptions.subscribe(channel, sink, self.gate()) {
            Some(channel) => self.send_subscribe(&channel).into_iter().collect(),
            None => Vec::new(),
        }
    }

    /// Removes a handler and returns the frames to send, if any.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> Vec<String> {
        let confirm = self.profile.confirms_unsubscribe();
        let Some(removal) = self.subscriptions.unsubscribe(handle, confirm) else {
            debug!(%handle, "Unsubscribe for unknown handle");
            return Vec::new();
        };
        if self.subscriptions.state(&removal.channel) == Some(SubscriptionState::Unsubscribing) {
            return self.send_unsubscribe(&removal.channel);
        }
        if self.subscriptions.contains(&removal.channel) {
            return Vec::new();
        }

        let frames = if removal.wire {
            self.send_unsubscribe(&removal.channel)
        } else {
            Vec::new()
        };
        self.registry.unregister_channel(&removal.channel);
        self.drop_book(&removal.channel);
        frames
    }

    /// Forgets the book for `channel` once nothing watches its symbol.
    fn drop_book(&mut self, channel: &Channel) {
        if channel.kind != ChannelType::OrderBook {
            return;
        }
        let still_watched = self
            .subscriptions
            .channels()
            .any(|c| c.kind == ChannelType::OrderBook && c.symbol == channel.symbol);
        if !still_watched {
            self.books.remove(channel.symbol_or_empty());
        }
    }

    /// Requests a fresh snapshot for a stale book.
    pub fn resnapshot(&mut self, channel: &Channel) -> Vec<String> {
        match self.profile.resnapshot(channel) {
            Resnapshot::Request(frame) => vec![frame],
            Resnapshot::Resubscribe => {
                let mut frames = self.send_unsubscribe(channel);
                match self.profile.subscribe_request(channel) {
                    Ok(frame) => frames.push(frame),
                    Err(e) => warn!(%channel, error = %e, "Could not encode subscribe request"),
                }
                frames
            }
        }
    }

    /// Returns a copy of the current book for `symbol`.
    pub fn order_book(&self, symbol: &str) -> Option<OrderBook> {
        self.books.get(symbol)
    }

    /// Application-level keepalive for this exchange, if it has one.
    pub fn ping_frame(&self) -> Option<String> {
        self.profile.ping_request()
    }

    /// Processes one raw text frame and returns the frames to send back.
    ///
    /// Never fails: malformed or unexpected frames are logged and dropped.
    pub fn handle_text(&mut self, raw: &str) -> Vec<String> {
        match self.classify(raw) {
            Ok(Frame::Unknown) => {
                warn!(frame = raw, "Dropping unclassified frame");
                Vec::new()
            }
            Ok(frame) => self.handle_frame(frame),
            Err(e) => {
                warn!(error = %e, frame = raw, "Dropping malformed frame");
                Vec::new()
            }
        }
    }

    pub fn handle_frame(&mut self, frame: Frame) -> Vec<String> {
        match frame {
            Frame::Control(control) => self.on_control(control),
            Frame::ChannelMessage { id, payload } => self.on_channel_message(&id, payload),
            Frame::AuthAck { success, message } => self.on_auth_ack(success, message),
            Frame::Error(message) => {
                warn!(error = %message, "Exchange reported an error");
                Vec::new()
            }
            Frame::Unknown => Vec::new(),
        }
    }

    fn on_auth_ack(&mut self, success: bool, message: Option<String>) -> Vec<String> {
        let Some(session) = self.auth.as_mut() else {
            warn!(success, "Login acknowledgement without a login request");
            return Vec::new();
        };
        if session.state() != AuthState::Pending {
            session.on_login_ack(success);
            return Vec::new();
        }
        match session.on_login_ack(success) {
            AuthState::Authenticated => self.become_ready(),
            _ => {
                let reason = message.unwrap_or_else(|| "login rejected".into());
                self.fail_private(&reason);
                self.become_ready()
            }
        }
    }

    fn on_control(&mut self, control: Control) -> Vec<String> {
        match control {
            Control::Ping { reply } => reply.into_iter().collect(),
            Control::Pong | Control::Heartbeat => Vec::new(),
            Control::Info(text) => {
                info!(%text, "Exchange info");
                Vec::new()
            }
            Control::Subscribed { channel, id } => {
                if let Some(id) = id {
                    self.registry.bind(&channel, id);
                }
                match self.subscriptions.state(&channel) {
                    Some(SubscriptionState::Pending) => {
                        self.subscriptions.on_ack(&channel);
                        info!(%channel, channel_id = ?self.registry.id_of(&channel), "Subscription active");
                        Vec::new()
                    }
                    Some(SubscriptionState::Active) => Vec::new(),
                    // The last handler left before the id was known.
                    Some(SubscriptionState::Unsubscribing) => self.send_unsubscribe(&channel),
                    None => {
                        debug!(%channel, "Acknowledgement for unwanted channel, unsubscribing");
                        let frames = self.send_unsubscribe(&channel);
                        if !self.profile.confirms_unsubscribe() {
                            self.registry.unregister_channel(&channel);
                        }
                        frames
                    }
                }
            }
            Control::SubscribeRejected {
                channel,
                id,
                reason,
            } => {
                let channel = channel.or_else(|| {
                    id.as_ref()
                        .and_then(|id| self.registry.resolve(id))
                        .cloned()
                });
                match channel {
                    Some(channel) => {
                        self.registry.unregister_channel(&channel);
                        self.subscriptions.on_reject(&channel, &reason);
                        self.drop_book(&channel);
                    }
                    None => warn!(reason, "Subscribe rejected for unknown channel"),
                }
                Vec::new()
            }
            Control::Unsubscribed { id } => {
                let Some(channel) = self.registry.unregister(&id) else {
                    debug!(channel_id = %id, "Unsubscribe confirmation for unknown channel");
                    return Vec::new();
                };
                if self.subscriptions.on_unsubscribed(&channel) {
                    self.drop_book(&channel);
                } else {
                    // Still wanted (revived or resubscribing); await the new id.
                    self.registry.register(&channel);
                }
                Vec::new()
            }
        }
    }

    fn on_channel_message(&mut self, id: &ChannelId, payload: Value) -> Vec<String> {
        let Some(channel) = self.registry.resolve(id).cloned() else {
            debug!(channel_id = %id, "Dropping message for unknown channel");
            return Vec::new();
        };
        let payloads = match self.profile.decode(&channel, payload) {
            Ok(payloads) => payloads,
            Err(e) => {
                warn!(%channel, error = %e, "Dropping undecodable payload");
                return Vec::new();
            }
        };

        let mut frames = Vec::new();
        let mut gone = Vec::new();
        for payload in payloads {
            let outcome = match payload {
                Payload::Event(event) => {
                    gone.extend(self.subscriptions.dispatch(&channel, &event));
                    continue;
                }
                Payload::Snapshot(snapshot) => self.books.apply_snapshot(
                    &snapshot.symbol,
                    &snapshot.bids,
                    &snapshot.asks,
                    snapshot.timestamp,
                    snapshot.sequence,
                ),
                Payload::Delta(delta) => self.books.apply_deltas(
                    &delta.symbol,
                    &delta.levels,
                    delta.timestamp,
                    delta.sequence,
                ),
            };
            match outcome {
                BookOutcome::Changed(change) => {
                    let event = MarketEvent::Book(change);
                    gone.extend(self.subscriptions.dispatch(&channel, &event));
                }
                BookOutcome::Buffered => {}
                BookOutcome::Resnapshot(reason) => {
                    info!(
                        %channel,
                        error = %reason.to_error(channel.symbol_or_empty()),
                        "Requesting order book resnapshot"
                    );
                    frames.extend(self.resnapshot(&channel));
                }
            }
        }

        for handle in gone {
            debug!(%channel, %handle, "Consumer went away, unsubscribing");
            frames.extend(self.unsubscribe(handle));
        }
        frames
    }
}
