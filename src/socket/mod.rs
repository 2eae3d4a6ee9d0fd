//! The client socket: connection lifecycle, calls, channels and auth over one WebSocket.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pubsub_socket::call::CallOptions;
//! use pubsub_socket::config::Config;
//! use pubsub_socket::socket::Socket;
//! # use pubsub_socket::transport::Transport;
//!
//! # async fn example(transport: Arc<dyn Transport>) -> pubsub_socket::Result<()> {
//! let config = Config::from_url("ws://localhost:3000")?;
//! let socket = Socket::new(config, transport);
//!
//! socket.connect(None).await?;
//! socket.subscribe("chat", &CallOptions::default()).await?;
//! socket
//!     .publish("chat", serde_json::json!({"text": "hi"}), &CallOptions::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub(crate) mod session;

use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use futures::Stream;
use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

pub use self::session::{
    ConnectionState, ProcedureHandler, ReceiverHandler, UnknownInvokeHandler,
    UnknownTransmitHandler,
};
use self::session::Inner;
use crate::Result;
use crate::call::{Call, CallOptions};
use crate::channels::ChannelState;
use crate::config::Config;
use crate::events::{ChannelEvent, SocketEvent, into_stream, next_matching};
use crate::protocol::{DataKind, UnsubscribeReason, close_code};
use crate::transport::{Batch, PreparedPackage, Responder, Transport};
use crate::ws::Connector;

/// Client side of a pub/sub and RPC session.
///
/// Cheap to clone; every clone drives the same session. Dropping the last clone closes the
/// connection and stops all timers.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<Inner>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("url", &self.inner.url)
            .field("state", &self.inner.state())
            .finish_non_exhaustive()
    }
}

impl Socket {
    /// Creates a socket that opens connections with [`TungsteniteConnector`](crate::ws::TungsteniteConnector).
    ///
    /// Must be called within a Tokio runtime. No connection is opened until the first
    /// [`Socket::connect`] or call.
    #[cfg(feature = "tungstenite")]
    #[must_use]
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Self {
        Self::with_connector(config, transport, Arc::new(crate::ws::TungsteniteConnector))
    }

    /// Creates a socket that opens raw connections through `connector`.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn with_connector(
        config: Config,
        transport: Arc<dyn Transport>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            inner: Inner::new(config, transport, connector),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The server URL, without the handshake attachment.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    // Connection

    /// Starts connecting unless a connection is open or in progress.
    ///
    /// The attempt starts immediately; the returned future resolves with the server's ready
    /// payload or fails with a [`ConnectAbort`](crate::error::ConnectAbort) error. Calling
    /// it again while connecting or open observes the same attempt. `timeout` overrides
    /// [`Config::connect_timeout`].
    pub fn connect(&self, timeout: Option<Duration>) -> impl Future<Output = Result<Value>> + Send + use<> {
        self.inner.connect(timeout)
    }

    /// Closes an open connection with `code`. Codes 1000 and 4500 and above are permanent,
    /// anything else is followed by an automatic reconnect when enabled.
    ///
    /// When no connection is open this only cancels a scheduled reconnect.
    pub fn disconnect(&self, code: u16, reason: Option<&str>) {
        self.inner.disconnect(code, reason);
    }

    /// Disconnects normally, then connects again.
    pub fn reconnect(&self, timeout: Option<Duration>) -> impl Future<Output = Result<Value>> + Send + use<> {
        self.inner.disconnect(close_code::NORMAL, None);
        self.inner.connect(timeout)
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    #[must_use]
    pub fn is_connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Reconnect attempts scheduled since the last successful open.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts()
    }

    // Calls

    /// Sends a fire-and-forget message to a server receiver.
    ///
    /// The returned [`Call`] resolves once the package was written. Triggers a connect when
    /// no connection is open; the package waits in the transport buffer meanwhile.
    pub fn transmit(&self, receiver: &str, data: Value, options: &CallOptions) -> Call<()> {
        self.inner.transmit(receiver, data, options)
    }

    /// Invokes a server procedure and resolves with its response.
    pub fn invoke(&self, procedure: &str, data: Value, options: &CallOptions) -> Call<Value> {
        self.inner.invoke(procedure, data, options)
    }

    /// Publishes `data` to `channel`; acknowledged when [`CallOptions::ack`] is set.
    pub fn publish(&self, channel: &str, data: Value, options: &CallOptions) -> Call<()> {
        self.inner.publish(channel, data, options)
    }

    pub fn flush_buffer(&self) {
        self.inner.transport.flush_buffer();
    }

    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.inner.transport.buffer_size()
    }

    pub fn send_prepared_package(&self, package: &PreparedPackage, batch: Option<Batch>) {
        self.inner
            .transport
            .send_prepared_package(package, batch);
    }

    #[must_use]
    pub fn has_low_send_backpressure(&self) -> bool {
        self.inner.has_low_send_backpressure()
    }

    // Channels

    /// Subscribes to `channel`.
    ///
    /// The channel is tracked as pending right away and resumed after reconnects and auth
    /// changes; it only counts as subscribed once the server acknowledged. Resolves
    /// immediately when already subscribed.
    pub fn subscribe(&self, channel: &str, options: &CallOptions) -> impl Future<Output = Result<()>> + Send + use<> {
        let task = self.inner.subscribe(channel, options);
        async move {
            match task {
                Some(task) => task.await?,
                None => Ok(()),
            }
        }
    }

    /// Stops tracking `channel` and tells the server, best effort.
    pub fn unsubscribe(&self, channel: &str, options: &CallOptions) -> impl Future<Output = Result<()>> + Send + use<> {
        self.inner.unsubscribe(channel, options)
    }

    /// Unsubscribes every tracked channel, pending ones included.
    pub fn unsubscribe_all(&self, options: &CallOptions) -> impl Future<Output = Result<()>> + Send + use<> {
        let calls: Vec<_> = self
            .inner
            .channels
            .subscriptions(true)
            .iter()
            .map(|channel| self.inner.unsubscribe(channel, options))
            .collect();
        async move { futures::future::try_join_all(calls).await.map(drop) }
    }

    #[must_use]
    pub fn has_subscribed(&self, channel: &str, include_pending: bool) -> bool {
        self.inner
            .channels
            .has_subscribed(channel, include_pending)
    }

    #[must_use]
    pub fn channel_state(&self, channel: &str) -> Option<ChannelState> {
        self.inner.channels.state(channel)
    }

    /// Tracked channel names, sorted.
    #[must_use]
    pub fn subscriptions(&self, include_pending: bool) -> Vec<String> {
        self.inner.channels.subscriptions(include_pending)
    }

    // Auth

    /// Authenticates with a signed token. On success the decoded token is applied and the
    /// signed token persisted in the token store.
    pub fn authenticate(&self, signed_token: &str, options: &CallOptions) -> Call<()> {
        self.inner
            .authenticate(signed_token.to_owned(), options)
    }

    /// Clears local auth and the persisted token, telling the server when connected.
    pub fn deauthenticate(&self) -> impl Future<Output = ()> + Send + use<> {
        self.inner.deauthenticate()
    }

    /// The decoded auth token.
    #[must_use]
    pub fn auth_token(&self) -> Option<Value> {
        self.inner.auth.token()
    }

    #[must_use]
    pub fn signed_auth_token(&self) -> Option<SecretString> {
        self.inner.auth.signed_token()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.inner.auth.is_authenticated()
    }

    // Events

    /// Subscribe to connection and auth events.
    ///
    /// Each call returns a new independent receiver.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<SocketEvent> {
        self.inner.events.subscribe()
    }

    /// Events of a single channel. Ends when [`Socket::remove_all_channel_listeners`] is
    /// called; yields a [`Lagged`](crate::ws::WsError::Lagged) error if the consumer falls
    /// behind.
    pub fn channel_events(&self, channel: &str) -> impl Stream<Item = Result<ChannelEvent>> + use<> {
        into_stream(self.inner.channels.hub().subscribe(channel))
    }

    /// Events of every channel, tagged with the channel name.
    pub fn all_channel_events(&self) -> impl Stream<Item = Result<(String, ChannelEvent)>> + use<> {
        into_stream(self.inner.channels.hub().subscribe_all())
    }

    /// Resolves with the name of the next channel (or `channel`) to become subscribed.
    pub fn once_subscribe(
        &self,
        channel: Option<&str>,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<String>> + Send + use<> {
        let filter = channel.map(str::to_owned);
        next_matching(
            self.inner.channels.hub().subscribe_all(),
            move |(name, event)| {
                (matches!(event, ChannelEvent::Subscribe) && accepts(filter.as_deref(), &name))
                    .then_some(name)
            },
            timeout,
        )
    }

    /// Resolves with the channel, reason and kick-out data of the next unsubscribe.
    pub fn once_unsubscribe(
        &self,
        channel: Option<&str>,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<(String, UnsubscribeReason, Option<Value>)>> + Send + use<> {
        let filter = channel.map(str::to_owned);
        next_matching(
            self.inner.channels.hub().subscribe_all(),
            move |(name, event)| match event {
                ChannelEvent::Unsubscribe { reason, data } if accepts(filter.as_deref(), &name) => {
                    Some((name, reason, data))
                }
                _ => None,
            },
            timeout,
        )
    }

    /// Resolves with the channel, data and binary flag of the next publication.
    pub fn once_publish(
        &self,
        channel: Option<&str>,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<(String, Value, bool)>> + Send + use<> {
        let filter = channel.map(str::to_owned);
        next_matching(
            self.inner.channels.hub().subscribe_all(),
            move |(name, event)| match event {
                ChannelEvent::Publish { data, is_binary } if accepts(filter.as_deref(), &name) => {
                    Some((name, data, is_binary))
                }
                _ => None,
            },
            timeout,
        )
    }

    /// Ends every channel event stream and fails pending once-listeners.
    pub fn remove_all_channel_listeners(&self) {
        self.inner.channels.hub().clear();
    }

    // Handlers

    /// Handles server transmits to `receiver`.
    ///
    /// `#connectionReady`, `#setAuthToken`, `#removeAuthToken`, `#kickOut` and `#publish` are
    /// consumed by the session and never reach user handlers. Any other name, including other
    /// `#` names, is delivered here.
    pub fn set_receiver<F>(&self, receiver: &str, handler: F)
    where
        F: Fn(Value, DataKind) + Send + Sync + 'static,
    {
        self.inner
            .receivers
            .insert(receiver.to_owned(), Arc::new(handler));
    }

    pub fn remove_receiver(&self, receiver: &str) {
        self.inner.receivers.remove(receiver);
    }

    /// Answers server invocations of `procedure` through the [`Responder`].
    pub fn set_procedure<F>(&self, procedure: &str, handler: F)
    where
        F: Fn(Value, DataKind, Responder) + Send + Sync + 'static,
    {
        self.inner
            .procedures
            .insert(procedure.to_owned(), Arc::new(handler));
    }

    pub fn remove_procedure(&self, procedure: &str) {
        self.inner.procedures.remove(procedure);
    }

    /// Called for transmits to receivers without a handler.
    pub fn on_unknown_transmit<F>(&self, handler: F)
    where
        F: Fn(&str, Value, DataKind) + Send + Sync + 'static,
    {
        *self
            .inner
            .unknown_transmit
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Called for invocations of procedures without a handler. Without one, such invocations
    /// are left unanswered.
    pub fn on_unknown_invoke<F>(&self, handler: F)
    where
        F: Fn(&str, Value, DataKind, Responder) + Send + Sync + 'static,
    {
        *self
            .inner
            .unknown_invoke
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }
}

fn accepts(filter: Option<&str>, channel: &str) -> bool {
    filter.is_none_or(|wanted| wanted == channel)
}
