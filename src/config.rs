use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde_json::Value;
use url::Url;

use crate::Result;
use crate::token_store::TokenStore;

const DEFAULT_HOSTNAME: &str = "localhost";
const DEFAULT_PATH: &str = "/";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(7);
const DEFAULT_INVOKE_SEND_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_LOW_SEND_BACKPRESSURE_MARK: usize = 209_715;

const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_RANDOMNESS: Duration = Duration::from_secs(5);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_MULTIPLIER: f64 = 1.5;

const HTTP_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;

/// Characters `encodeURIComponent` leaves untouched.
const URI_COMPONENT: &percent_encoding::AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Socket configuration.
///
/// Start from [`Config::default`] or [`Config::from_url`] and adjust the public fields.
#[non_exhaustive]
#[derive(Clone)]
pub struct Config {
    /// Host the socket connects to
    pub hostname: String,
    /// Port; `None` uses the scheme default
    pub port: Option<u16>,
    /// Connect with `wss` instead of `ws`
    pub secure: bool,
    /// Request path; normalized to a leading slash without a trailing one
    pub path: String,
    /// Default time budget for a connect attempt
    pub connect_timeout: Duration,
    /// Time the transport waits for an invocation acknowledgement
    pub ack_timeout: Duration,
    /// Default send timeout for invocations; `None` waits indefinitely
    pub invoke_send_timeout: Option<Duration>,
    /// Default send timeout for transmits; `None` waits indefinitely
    pub transmit_send_timeout: Option<Duration>,
    /// Reconnection policy
    pub auto_reconnect: AutoReconnect,
    /// Resume tracked channels once a connection opens
    pub auto_resubscribe: bool,
    /// Arbitrary JSON sent with the handshake as query string
    pub handshake_attachment: Option<Value>,
    /// Persistence for the signed auth token
    pub token_store: Option<Arc<dyn TokenStore>>,
    /// Buffered byte count at or below which the socket counts as drained
    pub low_send_backpressure_mark: usize,
    /// Maximum number of packages the transport may buffer; `None` is unbounded
    pub max_package_buffer_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOSTNAME.to_owned(),
            port: None,
            secure: false,
            path: DEFAULT_PATH.to_owned(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            invoke_send_timeout: Some(DEFAULT_INVOKE_SEND_TIMEOUT),
            transmit_send_timeout: None,
            auto_reconnect: AutoReconnect::default(),
            auto_resubscribe: true,
            handshake_attachment: None,
            token_store: None,
            low_send_backpressure_mark: DEFAULT_LOW_SEND_BACKPRESSURE_MARK,
            max_package_buffer_size: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("path", &self.path)
            .field("connect_timeout", &self.connect_timeout)
            .field("ack_timeout", &self.ack_timeout)
            .field("invoke_send_timeout", &self.invoke_send_timeout)
            .field("transmit_send_timeout", &self.transmit_send_timeout)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("auto_resubscribe", &self.auto_resubscribe)
            .field("handshake_attachment", &self.handshake_attachment)
            .field("token_store", &self.token_store.is_some())
            .field("low_send_backpressure_mark", &self.low_send_backpressure_mark)
            .field("max_package_buffer_size", &self.max_package_buffer_size)
            .finish()
    }
}

impl Config {
    /// Default configuration with the endpoint taken from `url`.
    pub fn from_url(url: &str) -> Result<Self> {
        let mut config = Self::default();
        parse_options_from_url(url)?.apply(&mut config);
        Ok(config)
    }

    /// The endpoint URL, `ws[s]://host[:port]path`, omitting the scheme's default port.
    #[must_use]
    pub fn url(&self) -> String {
        let default_port = if self.secure { HTTPS_PORT } else { HTTP_PORT };
        let port = match self.port {
            Some(port) if port != default_port => format!(":{port}"),
            _ => String::new(),
        };
        let scheme = if self.secure { "wss" } else { "ws" };
        format!(
            "{scheme}://{}{port}{}",
            self.hostname,
            preprocess_path(&self.path)
        )
    }

    /// The URL used for the handshake: [`Config::url`] plus the percent-encoded attachment.
    #[must_use]
    pub fn handshake_url(&self) -> String {
        let url = self.url();
        match &self.handshake_attachment {
            Some(attachment) => {
                let json = attachment.to_string();
                format!("{url}?{}", utf8_percent_encode(&json, URI_COMPONENT))
            }
            None => url,
        }
    }
}

/// Automatic reconnection policy.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct AutoReconnect {
    /// Reconnect when the connection is lost
    pub active: bool,
    /// Base delay of the first attempt
    pub initial_delay: Duration,
    /// Growth factor applied per attempt
    pub multiplier: f64,
    /// Upper bound of the random jitter added to the base delay
    pub randomness: Duration,
    /// Cap for a single delay; `None` is uncapped
    pub max_delay: Option<Duration>,
}

impl Default for AutoReconnect {
    fn default() -> Self {
        Self {
            active: true,
            initial_delay: DEFAULT_INITIAL_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            randomness: DEFAULT_RANDOMNESS,
            max_delay: Some(DEFAULT_MAX_DELAY),
        }
    }
}

impl AutoReconnect {
    /// A policy that never reconnects.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            active: false,
            ..Self::default()
        }
    }
}

/// Reconnect delay schedule driven by an attempt counter.
///
/// Each call to [`Backoff::next_backoff`] uses the current attempt count as exponent and
/// then increments it; [`Backoff::reset`] is called once a connection opens.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    policy: AutoReconnect,
    attempts: u32,
}

impl ReconnectBackoff {
    #[must_use]
    pub fn new(policy: AutoReconnect) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Number of attempts scheduled since the last successful open.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Counts an attempt that is scheduled without delay.
    pub fn next_immediate(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        Duration::ZERO
    }

    #[expect(
        clippy::float_arithmetic,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "delays are computed in floating point milliseconds and rounded like the server expects"
    )]
    fn delay(&self, exponent: u32, jitter: f64) -> Duration {
        let policy = &self.policy;
        let base = policy
            .randomness
            .as_secs_f64()
            .mul_add(jitter, policy.initial_delay.as_secs_f64())
            * 1000.0;
        let exponent = i32::try_from(exponent).unwrap_or(i32::MAX);
        let mut millis = (base.round() * policy.multiplier.powi(exponent)).round();
        if let Some(max) = policy.max_delay {
            millis = millis.min(max.as_secs_f64() * 1000.0);
        }
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

impl Backoff for ReconnectBackoff {
    fn reset(&mut self) {
        self.attempts = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if !self.policy.active {
            return None;
        }
        let exponent = self.attempts;
        self.attempts = self.attempts.saturating_add(1);
        Some(self.delay(exponent, rand::random::<f64>()))
    }
}

/// Endpoint fields extracted from a URL by [`parse_options_from_url`].
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlOptions {
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub secure: bool,
    pub path: Option<String>,
}

impl UrlOptions {
    /// Overwrites the endpoint fields of `config` with the parsed values.
    pub fn apply(self, config: &mut Config) {
        if let Some(hostname) = self.hostname {
            config.hostname = hostname;
        }
        if let Some(port) = self.port {
            config.port = Some(port);
        }
        config.secure = self.secure;
        if let Some(path) = self.path {
            config.path = path;
        }
    }
}

/// Parses the endpoint part of `url`. A missing scheme is treated as `ws://`.
pub fn parse_options_from_url(url: &str) -> Result<UrlOptions> {
    let has_scheme = url
        .split_once("://")
        .is_some_and(|(scheme, _)| scheme.chars().all(|c| c.is_ascii_alphabetic()));
    let parsed = if has_scheme {
        Url::parse(url)?
    } else {
        Url::parse(&format!("ws://{url}"))?
    };

    let path = parsed.path();
    Ok(UrlOptions {
        hostname: parsed.host_str().map(str::to_owned),
        port: parsed.port(),
        secure: parsed.scheme() == "wss",
        path: (!path.is_empty()).then(|| path.to_owned()),
    })
}

/// Adds a leading slash to a non-empty path and strips one trailing slash.
#[must_use]
pub fn preprocess_path(path: &str) -> String {
    let mut path = if path.is_empty() || path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    };
    if path.ends_with('/') {
        path.pop();
    }
    path
}
