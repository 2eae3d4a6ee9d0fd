//! Seams between the session and the WebSocket implementation.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::Result;

/// A single WebSocket data frame.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    /// Payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Notifications a raw socket delivers to the session, in order.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    Open,
    Message(Frame),
    /// `code` is `None` when the peer closed without a status code
    Close { code: Option<u16>, reason: String },
    Error(String),
    /// Bytes left in the send buffer after a write completed
    Drain(usize),
}

/// Receiving half of a raw socket's event channel.
pub type RawEvents = mpsc::UnboundedReceiver<RawEvent>;

/// A single WebSocket connection as seen by the session.
pub trait RawSocket: Send + Sync {
    fn send(&self, frame: Frame) -> Result<()>;

    /// Starts the close handshake. Never fails; a socket that is already gone ignores it.
    fn close(&self, code: u16, reason: Option<&str>);

    /// Bytes queued but not yet written.
    fn buffered_amount(&self) -> usize;
}

/// Parameters of the opening handshake.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Target URL including the encoded attachment query
    pub url: String,
    /// Value for the `Sec-WebSocket-Protocol` header
    pub protocol: String,
}

impl HandshakeRequest {
    #[must_use]
    pub fn new(url: String, protocol: String) -> Self {
        Self { url, protocol }
    }
}

/// Opens raw sockets.
///
/// `create_connection` returns immediately; the socket reports [`RawEvent::Open`] (or an
/// error and close) through the returned event channel once the handshake finishes.
pub trait Connector: Send + Sync {
    fn create_connection(&self, request: &HandshakeRequest) -> Result<(Arc<dyn RawSocket>, RawEvents)>;
}
