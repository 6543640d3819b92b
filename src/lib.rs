//! Exchange-agnostic streaming market data client.
//!
//! Maintains one WebSocket connection per [`StreamClient`], multiplexes
//! logical channel subscriptions over it, keeps local order books in sync
//! from snapshots and deltas, and survives disconnects by reconnecting and
//! replaying every subscription. Exchange wire formats live behind the
//! [`profile::ExchangeProfile`] trait.

pub mod auth;
pub mod book;
pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod profile;
pub mod registry;
pub mod router;
pub mod subscription;
pub mod websocket;

pub use client::StreamClient;
pub use config::{BackoffPolicy, ClientConfig};
pub use error::{Result, TickmuxError};
pub use models::{Channel, ChannelType, MarketEvent, OrderBook};
pub use subscription::{StreamFailure, Subscription, SubscriptionHandle, Update};
pub use websocket::ConnectionState;
