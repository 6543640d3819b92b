//! Async WebSocket transport.
//!
//! - [`connection`] - Connection lifecycle, heartbeat and reconnect loop

pub mod connection;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use tungstenite::Message;

use crate::Result;

pub use connection::{Command, ConnectionManager, ConnectionState};

/// Write half of an exchange WebSocket connection.
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Read half of an exchange WebSocket connection.
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Establishes a WebSocket connection to the given URL.
///
/// # Errors
///
/// Returns a [`TickmuxError`](crate::TickmuxError) if the connection or TLS handshake fails.
pub async fn connect(url: &str) -> Result<(WsWriter, WsReader)> {
    let (ws_stream, _) = connect_async(url).await?;
    info!(url, "WebSocket handshake completed");

    Ok(ws_stream.split())
}

/// Writes text frames in order and flushes once.
///
/// # Errors
///
/// Returns a [`TickmuxError`](crate::TickmuxError) if the socket rejects a write.
pub async fn send_all(write: &mut WsWriter, frames: Vec<String>) -> Result<()> {
    if frames.is_empty() {
        return Ok(());
    }
    for frame in frames {
        debug!(frame = %frame, "Sending frame");
        write.feed(Message::Text(frame.into())).await?;
    }
    write.flush().await?;

    Ok(())
}

/// Sends a protocol-level WebSocket ping.
///
/// # Errors
///
/// Returns a [`TickmuxError`](crate::TickmuxError) if sending the frame fails.
pub async fn ping(write: &mut WsWriter) -> Result<()> {
    write.send(Message::Ping(Default::default())).await?;
    debug!("Sent ping");

    Ok(())
}
