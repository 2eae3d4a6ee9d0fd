//! Protocol constants shared by the session layer: close codes, reserved event names and
//! the small enums exchanged with the [`Transport`](crate::transport::Transport).

use phf::phf_map;
use serde_repr::{Deserialize_repr, Serialize_repr};
use strum_macros::Display;

/// Sub-protocol announced in the `Sec-WebSocket-Protocol` header.
pub const DEFAULT_SUBPROTOCOL: &str = "ziron";

/// Close codes with a reserved meaning for the session layer.
pub mod close_code {
    /// Normal closure; never reconnects.
    pub const NORMAL: u16 = 1000;
    /// Closed without a status code; reconnects immediately.
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure (hang up, failed send, failed handshake).
    pub const ABNORMAL: u16 = 1006;
    /// The server stopped pinging within the agreed interval.
    pub const SERVER_PING_TIMEOUT: u16 = 4000;
    /// The server did not receive a pong in time.
    pub const CLIENT_PONG_TIMEOUT: u16 = 4001;
    /// The handshake did not complete before the connect timeout.
    pub const CONNECT_TIMEOUT: u16 = 4007;
    /// The transport received a message it could not decode.
    pub const BAD_MESSAGE: u16 = 4400;
    /// Codes at or above this value are permanent disconnects.
    pub const PERMANENT_THRESHOLD: u16 = 4500;
}

static CLOSE_REASONS: phf::Map<u16, &'static str> = phf_map! {
    1000_u16 => "Normal closure",
    1001_u16 => "Going away",
    1002_u16 => "Protocol error",
    1003_u16 => "Unsupported data",
    1005_u16 => "No status received",
    1006_u16 => "Abnormal closure",
    1007_u16 => "Invalid frame payload data",
    1008_u16 => "Policy violation",
    1009_u16 => "Message too big",
    1010_u16 => "Mandatory extension",
    1011_u16 => "Internal server error",
    1012_u16 => "Service restart",
    1013_u16 => "Try again later",
    1014_u16 => "Bad gateway",
    1015_u16 => "TLS handshake failure",
    4000_u16 => "Server ping timed out",
    4001_u16 => "Client pong timed out",
    4007_u16 => "Connect timeout",
    4400_u16 => "Bad message",
    4403_u16 => "Forbidden",
    4500_u16 => "Server rejected the connection",
};

/// Fallback used when neither an explicit reason nor a known close code is available.
pub const UNKNOWN_REASON: &str = "Unknown reason";

/// Human readable reason for a close code, if the code is known.
#[must_use]
pub fn close_reason(code: u16) -> Option<&'static str> {
    CLOSE_REASONS.get(&code).copied()
}

/// Resolves the reason reported with a close: the explicit one, then the code table,
/// then [`UNKNOWN_REASON`].
#[must_use]
pub fn resolve_close_reason(code: u16, explicit: Option<&str>) -> String {
    explicit
        .filter(|r| !r.is_empty())
        .or_else(|| close_reason(code))
        .unwrap_or(UNKNOWN_REASON)
        .to_owned()
}

/// What the reconnect scheduler does after a connection is destroyed with a given code.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// The peer is reachable but liveness lapsed; retry with zero delay.
    Immediate,
    /// Retry after the exponential backoff delay.
    Backoff,
    /// Permanent disconnect.
    Never,
}

impl ReconnectDecision {
    #[must_use]
    pub const fn for_code(code: u16) -> Self {
        match code {
            close_code::SERVER_PING_TIMEOUT
            | close_code::CLIENT_PONG_TIMEOUT
            | close_code::NO_STATUS => Self::Immediate,
            close_code::NORMAL => Self::Never,
            c if c >= close_code::PERMANENT_THRESHOLD => Self::Never,
            _ => Self::Backoff,
        }
    }
}

/// Transmit names the server uses for session control.
pub mod server_transmit {
    pub const CONNECTION_READY: &str = "#connectionReady";
    pub const SET_AUTH_TOKEN: &str = "#setAuthToken";
    pub const REMOVE_AUTH_TOKEN: &str = "#removeAuthToken";
    pub const KICK_OUT: &str = "#kickOut";
    pub const PUBLISH: &str = "#publish";
}

/// Procedures the server exposes to the client.
pub mod server_procedure {
    pub const AUTHENTICATE: &str = "#authenticate";
    pub const SUBSCRIBE: &str = "#subscribe";
    pub const PUBLISH: &str = "#publish";
}

/// Receivers the server exposes to the client.
pub mod server_receiver {
    pub const UNSUBSCRIBE: &str = "#unsubscribe";
    pub const DEAUTHENTICATE: &str = "#deauthenticate";
    pub const PUBLISH: &str = "#publish";
}

/// Shape of the payload carried by an inbound package.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DataKind {
    /// Plain JSON
    Json,
    /// Raw binary content
    Binary,
    /// JSON with embedded binary or stream content
    Mixed,
}

impl DataKind {
    /// Whether the payload carries anything other than plain JSON.
    #[must_use]
    pub const fn is_complex(self) -> bool {
        !matches!(self, Self::Json)
    }
}

/// Why the transport lost its connection, reported through
/// [`Transport::emit_bad_connection`](crate::transport::Transport::emit_bad_connection).
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BadConnectionKind {
    /// An open connection was lost
    Disconnect,
    /// A connect attempt never reached the open state
    ConnectAbort,
}

/// Why a channel left the subscribed state.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum UnsubscribeReason {
    /// The client unsubscribed
    Client = 0,
    /// The server kicked the client out of the channel
    KickOut = 1,
    /// The connection was lost while subscribed
    BadConnection = 2,
}

/// Auth token verdict sent by the server with the connection-ready signal.
///
/// A numeric verdict means the token offered during the handshake was not accepted.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum AuthTokenState {
    /// The token could not be verified
    Invalid = 0,
    /// The token has expired
    Expired = 1,
    /// The token is rejected and must be discarded
    Rejected = 2,
}

impl AuthTokenState {
    /// Maps a numeric verdict; codes the client does not know are treated as [`Self::Invalid`].
    #[must_use]
    pub const fn from_code(code: u64) -> Self {
        match code {
            1 => Self::Expired,
            2 => Self::Rejected,
            _ => Self::Invalid,
        }
    }

    /// Whether the persisted token should be removed as well.
    #[must_use]
    pub const fn removes_token(self) -> bool {
        matches!(self, Self::Rejected)
    }
}
