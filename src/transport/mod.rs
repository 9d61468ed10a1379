//! Injected WebSocket capability.
//!
//! The resilience engine never talks to a concrete WebSocket library;
//! it is handed a [`Transport`] and works purely in terms of socket
//! events and raw text payloads. [`tungstenite::WsTransport`] is the
//! production implementation.

#[cfg(test)]
pub mod mock;
pub mod tungstenite;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("socket error: {0}")]
    Socket(String),
}

/// Events surfaced by an established socket. A successful
/// [`Transport::connect`] is itself the `open` event.
#[derive(Debug)]
pub enum SocketEvent {
    /// A data message, as raw text. Decoding is the host's business.
    Message(String),
    /// Keepalive reply; counts as receive activity for stall detection.
    Pong,
    /// The peer (or the local side) closed the socket.
    Closed { code: u16, reason: String },
    /// A socket-level fault. A `Closed` event normally follows.
    Error(TransportError),
}

/// Sink/stream pair for one established socket.
pub type BoxedSocket = (Box<dyn SocketSink>, Box<dyn SocketStream>);

/// Factory for sockets against one upstream URL.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a socket, resolving once the connection is established.
    async fn connect(&self, url: &str) -> Result<BoxedSocket, TransportError>;
}

/// Write half of an established socket.
#[async_trait]
pub trait SocketSink: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;
    async fn ping(&mut self) -> Result<(), TransportError>;
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// Read half of an established socket. `None` means the stream ended
/// without a close frame (treated as an abnormal close by the caller).
#[async_trait]
pub trait SocketStream: Send {
    async fn next_event(&mut self) -> Option<SocketEvent>;
}
