//! Client session layer for a pub/sub and RPC protocol multiplexed over one WebSocket.
//!
//! A [`Socket`](socket::Socket) keeps a single connection alive. It pings to detect dead
//! peers, reconnects with exponential backoff, tracks channel subscriptions across
//! reconnects, and carries an auth token that can be persisted in a
//! [`TokenStore`](token_store::TokenStore).
//!
//! Package framing is not handled here. The socket drives a [`Transport`](transport::Transport)
//! that prepares, buffers and acknowledges packages, and reads and writes frames through a
//! [`Connector`](ws::Connector).
//!
//! # Feature flags
//!
//! - `tungstenite` (default): [`TungsteniteConnector`](ws::TungsteniteConnector), backed by
//!   `tokio-tungstenite`
//! - `tracing`: Emit `tracing` events for connection, auth and handler failures

pub mod auth;
pub mod call;
pub mod cancelable;
pub mod channels;
pub mod config;
pub(crate) mod deferred;
pub mod error;
pub mod events;
pub mod protocol;
pub mod socket;
pub mod token_store;
pub mod transport;
pub mod ws;

pub use call::{Call, CallOptions, SendTimeout};
pub use config::{AutoReconnect, Config};
pub use error::Error;
pub use events::{ChannelEvent, SocketEvent};
pub use socket::{ConnectionState, Socket};

pub type Result<T> = std::result::Result<T, Error>;
