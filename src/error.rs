//! Crate-level error types.
//!
//! [`TickmuxError`] unifies every error source (configuration, transport,
//! JSON, protocol, authentication, order book sequencing) behind a single
//! enum so callers can match on the variant they care about while still
//! using the `?` operator for easy propagation.

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TickmuxError>;

/// Top-level error type returned by all public APIs.
#[derive(Debug, thiserror::Error)]
pub enum TickmuxError {
    /// Configuration values are missing, inconsistent, or unparsable.
    #[error("configuration error: {0}")]
    Config(String),

    /// The socket is closed or unreachable. Recovered by reconnecting.
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A frame was malformed or could not be classified. The frame is
    /// dropped; the connection survives.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The exchange rejected the login, or the login could not be signed.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// An order book delta arrived out of sequence.
    #[error("sequence gap on {symbol}: expected {expected}, received {received}")]
    SequenceGap {
        symbol: String,
        expected: i64,
        received: i64,
    },

    /// The exchange rejected a subscribe request.
    #[error("subscription to {channel} rejected: {reason}")]
    Subscription { channel: String, reason: String },

    /// The client has not been connected yet.
    #[error("client is not connected")]
    NotConnected,

    /// The client was closed and no longer accepts requests.
    #[error("client is closed")]
    Closed,
}

impl From<crate::subscription::StreamFailure> for TickmuxError {
    fn from(failure: crate::subscription::StreamFailure) -> Self {
        use crate::subscription::StreamFailure;

        match failure {
            StreamFailure::Authentication(reason) => Self::Authentication(reason),
            StreamFailure::Subscription { channel, reason } => Self::Subscription {
                channel: channel.to_string(),
                reason,
            },
        }
    }
}
