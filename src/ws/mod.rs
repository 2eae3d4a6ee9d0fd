//! Raw WebSocket plumbing underneath the session.
//!
//! # Architecture
//!
//! - [`Connector`]: Opens a [`RawSocket`] for a [`HandshakeRequest`]
//! - [`RawSocket`]: Sends frames and starts the close handshake
//! - [`RawEvent`]: Open, message, close, error and drain notifications, delivered in order
//!
//! With the `tungstenite` feature, [`TungsteniteConnector`] provides a connector backed by
//! `tokio-tungstenite`.

#[cfg(feature = "tungstenite")]
pub mod connection;
pub mod error;
pub mod traits;

#[cfg(feature = "tungstenite")]
pub use connection::TungsteniteConnector;
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use traits::*;
