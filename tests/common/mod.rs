//! Shared test utilities: fixture loading, router helpers and a scripted
//! local WebSocket exchange.

#![allow(dead_code)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tickmux::models::Channel;
use tickmux::profile::ExchangeProfile;
use tickmux::router::Router;
use tickmux::subscription::{EventSink, Subscription, SubscriptionHandle, bounded};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tungstenite::Message;

/// Upper bound for any single wait in networked tests.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Parses a fixture file's contents.
pub fn fixture(raw: &str) -> Value {
    serde_json::from_str(raw).expect("Failed to parse fixture")
}

/// Parses outbound frames produced by the router.
pub fn parse_frames(frames: &[String]) -> Vec<Value> {
    frames
        .iter()
        .map(|frame| serde_json::from_str(frame).expect("Router produced invalid JSON"))
        .collect()
}

/// Creates a linked sink/subscription pair for `channel`.
pub fn queue(channel: &Channel) -> (EventSink, Subscription) {
    bounded(SubscriptionHandle::next(), channel.clone(), 64)
}

/// A router for `profile` without credentials, already in the ready state.
pub fn ready_router(profile: Box<dyn ExchangeProfile>) -> Router {
    let mut router = Router::new(profile, None, 64);
    let frames = router.on_connected();
    assert!(frames.is_empty(), "fresh router should not replay anything");
    router
}

/// A local WebSocket server that hands each accepted connection to the test.
pub struct MockExchange {
    pub url: String,
    connections: mpsc::UnboundedReceiver<ServerConnection>,
}

impl MockExchange {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock exchange");
        let addr = listener.local_addr().expect("Listener has no address");
        let (tx, connections) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                if tx.send(ServerConnection { ws }).is_err() {
                    break;
                }
            }
        });

        Self {
            url: format!("ws://{addr}/ws"),
            connections,
        }
    }

    /// Waits for the client's next connection.
    pub async fn accept(&mut self) -> ServerConnection {
        tokio::time::timeout(TIMEOUT, self.connections.recv())
            .await
            .expect("Timed out waiting for a client connection")
            .expect("Mock exchange listener stopped")
    }

    /// Returns the next connection if one arrives within `wait`.
    pub async fn accept_within(&mut self, wait: Duration) -> Option<ServerConnection> {
        tokio::time::timeout(wait, self.connections.recv())
            .await
            .ok()
            .flatten()
    }
}

/// Server side of one client connection.
pub struct ServerConnection {
    ws: WebSocketStream<TcpStream>,
}

impl ServerConnection {
    /// Waits for the next JSON text frame, skipping control frames.
    pub async fn recv_json(&mut self) -> Value {
        loop {
            let message = tokio::time::timeout(TIMEOUT, self.ws.next())
                .await
                .expect("Timed out waiting for a client frame")
                .expect("Client closed the connection")
                .expect("WebSocket error on the server side");
            if let Message::Text(text) = message {
                return serde_json::from_str(text.as_str()).expect("Client sent invalid JSON");
            }
        }
    }

    pub async fn send_json(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string().into()))
            .await
            .expect("Failed to send server frame");
    }

    /// Drops the TCP connection without a close handshake.
    pub fn kill(self) {
        drop(self.ws);
    }
}
