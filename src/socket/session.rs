//! Session state shared by every [`Socket`](super::Socket) handle.
//!
//! All mutable connection state lives in [`Session`] behind one mutex. The lock is never held
//! across an `.await` or while calling into the transport, a raw socket or a user handler.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use backoff::backoff::Backoff as _;
use dashmap::DashMap;
use secrecy::{ExposeSecret as _, SecretString};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::task::AbortOnDropHandle;

use crate::Result;
use crate::auth::{AuthState, extract_auth_token};
use crate::call::{Call, CallOptions};
use crate::cancelable::{CancelablePromise, race_send_timeout};
use crate::channels::ChannelRegistry;
use crate::config::{Config, ReconnectBackoff};
use crate::deferred::Deferred;
use crate::error::{ConnectAbort, Error};
use crate::events::{EVENT_CAPACITY, SocketEvent};
use crate::protocol::{
    AuthTokenState, BadConnectionKind, DEFAULT_SUBPROTOCOL, DataKind, ReconnectDecision,
    close_code, resolve_close_reason, server_procedure, server_receiver, server_transmit,
};
use crate::token_store::TokenStoreEngine;
use crate::transport::{
    Batch, PreparedInvoke, PreparedPackage, Responder, Transport, TransportLink,
    TransportSettings,
};
use crate::ws::{Connector, Frame, HandshakeRequest, RawEvent, RawEvents, RawSocket, WsError};

/// Added to the server's ping interval before a missing ping counts as a timeout.
const PING_GRACE: Duration = Duration::from_secs(1);
/// Ping budget until the server announces its interval.
const INITIAL_PING_TIMEOUT: Duration = Duration::from_secs(200);

const TRANSMIT_SEND_TIMEOUT: &str = "Transmit send timeout reached.";
const INVOKE_SEND_TIMEOUT: &str = "Invoke send timeout reached.";
const BAD_MESSAGE_REASON: &str = "Bad message";

/// Connection lifecycle state.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Closed,
    Connecting,
    Open,
}

/// Handles a server transmit addressed to a named receiver.
pub type ReceiverHandler = Arc<dyn Fn(Value, DataKind) + Send + Sync>;
/// Handles a server invocation of a named procedure.
pub type ProcedureHandler = Arc<dyn Fn(Value, DataKind, Responder) + Send + Sync>;
/// Fallback for transmits to receivers without a handler.
pub type UnknownTransmitHandler = Arc<dyn Fn(&str, Value, DataKind) + Send + Sync>;
/// Fallback for invocations of procedures without a handler.
pub type UnknownInvokeHandler = Arc<dyn Fn(&str, Value, DataKind, Responder) + Send + Sync>;

type ConnectDeferred = Deferred<std::result::Result<Value, ConnectAbort>>;

#[derive(Debug, Clone, Copy)]
enum TickerKind {
    Connect,
    Ping,
    Reconnect,
}

struct Ticker {
    id: u64,
    _task: AbortOnDropHandle<()>,
}

enum TokenOp {
    Save(SecretString),
    Remove,
}

struct Session {
    state: ConnectionState,
    /// Bumped on every connect and destroy; raw events and timers carry the id they were
    /// started under
    connection_id: u64,
    raw: Option<Arc<dyn RawSocket>>,
    /// The raw socket reported open; the ready transmit is only honored afterwards
    raw_open: bool,
    connection_task: Option<AbortOnDropHandle<()>>,
    connect_deferred: Option<Arc<ConnectDeferred>>,
    ping_timeout: Duration,
    ticker_seq: u64,
    connect_ticker: Option<Ticker>,
    ping_ticker: Option<Ticker>,
    reconnect_ticker: Option<Ticker>,
    backoff: ReconnectBackoff,
}

pub(crate) struct Inner {
    pub(super) config: Config,
    pub(super) url: String,
    pub(super) transport: Arc<dyn Transport>,
    connector: Arc<dyn Connector>,
    token_store: Arc<TokenStoreEngine>,
    token_ops: mpsc::UnboundedSender<TokenOp>,
    pub(super) auth: AuthState,
    pub(super) channels: ChannelRegistry,
    pub(super) receivers: DashMap<String, ReceiverHandler>,
    pub(super) procedures: DashMap<String, ProcedureHandler>,
    pub(super) unknown_transmit: RwLock<Option<UnknownTransmitHandler>>,
    pub(super) unknown_invoke: RwLock<Option<UnknownInvokeHandler>>,
    pub(super) events: broadcast::Sender<SocketEvent>,
    pub(super) state_tx: watch::Sender<ConnectionState>,
    session: Mutex<Session>,
}

impl Inner {
    pub(super) fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let url = config.url();
        let token_store = Arc::new(TokenStoreEngine::new(config.token_store.clone()));
        let token_ops = spawn_token_worker(Arc::clone(&token_store));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        let settings = TransportSettings {
            ack_timeout: config.ack_timeout,
            max_package_buffer_size: config.max_package_buffer_size,
        };
        let session = Session {
            state: ConnectionState::Closed,
            connection_id: 0,
            raw: None,
            raw_open: false,
            connection_task: None,
            connect_deferred: None,
            ping_timeout: INITIAL_PING_TIMEOUT,
            ticker_seq: 0,
            connect_ticker: None,
            ping_ticker: None,
            reconnect_ticker: None,
            backoff: ReconnectBackoff::new(config.auto_reconnect.clone()),
        };

        let inner = Arc::new(Self {
            config,
            url,
            transport,
            connector,
            token_store,
            token_ops,
            auth: AuthState::default(),
            channels: ChannelRegistry::default(),
            receivers: DashMap::new(),
            procedures: DashMap::new(),
            unknown_transmit: RwLock::new(None),
            unknown_invoke: RwLock::new(None),
            events,
            state_tx,
            session: Mutex::new(session),
        });
        inner
            .transport
            .attach(TransportLink::new(&inner), settings);
        inner
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, session: &mut Session, state: ConnectionState) {
        session.state = state;
        _ = self.state_tx.send_replace(state);
        #[cfg(feature = "tracing")]
        tracing::debug!(?state, url = %self.url, "Connection state changed");
    }

    fn emit(&self, event: SocketEvent) {
        _ = self.events.send(event);
    }

    pub(super) fn state(&self) -> ConnectionState {
        self.session().state
    }

    pub(super) fn reconnect_attempts(&self) -> u32 {
        self.session().backoff.attempts()
    }

    // Connection lifecycle

    pub(super) fn connect(
        self: &Arc<Self>,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<Value>> + Send + use<> {
        let promise = self.start_connect(timeout).promise();
        async move {
            match promise.await {
                Some(Ok(ready)) => Ok(ready),
                Some(Err(abort)) => Err(abort.into()),
                None => Err(Error::cancellation()),
            }
        }
    }

    /// Starts a connect attempt when closed; otherwise returns the attempt in progress.
    fn start_connect(self: &Arc<Self>, timeout: Option<Duration>) -> Arc<ConnectDeferred> {
        let mut session = self.session();
        if session.state != ConnectionState::Closed
            && let Some(deferred) = &session.connect_deferred
        {
            return Arc::clone(deferred);
        }

        let deferred = Arc::new(Deferred::new());
        session.connect_deferred = Some(Arc::clone(&deferred));
        session.connection_id = session.connection_id.wrapping_add(1);
        session.raw_open = false;
        session.reconnect_ticker = None;

        let connect_timeout = timeout.unwrap_or(self.config.connect_timeout);
        session.connect_ticker = Some(self.arm_ticker(&mut session, TickerKind::Connect, connect_timeout));

        let task = tokio::spawn(Self::run_connection(
            Arc::downgrade(self),
            session.connection_id,
        ));
        session.connection_task = Some(AbortOnDropHandle::new(task));
        self.set_state(&mut session, ConnectionState::Connecting);

        deferred
    }

    fn connect_unless_open(self: &Arc<Self>) {
        let open = self.state() == ConnectionState::Open;
        if !open {
            self.start_connect(None);
        }
    }

    async fn run_connection(weak: Weak<Self>, connection_id: u64) {
        let Some(inner) = weak.upgrade() else {
            return;
        };

        let protocol = match inner.token_store.load_token().await {
            Some(signed) => format!("{signed}@{DEFAULT_SUBPROTOCOL}"),
            None => DEFAULT_SUBPROTOCOL.to_owned(),
        };
        let request = HandshakeRequest::new(inner.config.handshake_url(), protocol);

        let (raw, events) = match inner.connector.create_connection(&request) {
            Ok(connection) => connection,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, url = %inner.url, "Unable to create connection");
                inner.destroy_connection(Some(connection_id), close_code::ABNORMAL, Some(e.to_string()));
                return;
            }
        };

        if !inner.bind_raw_socket(connection_id, &raw) {
            raw.close(close_code::NORMAL, None);
            return;
        }
        drop(inner);

        Self::pump(weak, connection_id, events).await;
    }

    async fn pump(weak: Weak<Self>, connection_id: u64, mut events: RawEvents) {
        while let Some(event) = events.recv().await {
            let Some(inner) = weak.upgrade() else {
                break;
            };
            inner.on_raw_event(connection_id, event);
        }
    }

    fn bind_raw_socket(&self, connection_id: u64, raw: &Arc<dyn RawSocket>) -> bool {
        let mut session = self.session();
        if session.connection_id != connection_id || session.state != ConnectionState::Connecting {
            return false;
        }
        session.raw = Some(Arc::clone(raw));
        true
    }

    fn on_raw_event(self: &Arc<Self>, connection_id: u64, event: RawEvent) {
        let state = {
            let mut session = self.session();
            if session.connection_id != connection_id {
                return;
            }
            if matches!(event, RawEvent::Open) {
                session.raw_open = true;
                return;
            }
            session.state
        };

        match event {
            RawEvent::Message(frame) => self.transport.emit_message(frame),
            RawEvent::Close { code, reason } => {
                self.destroy_connection(
                    Some(connection_id),
                    code.unwrap_or(close_code::NO_STATUS),
                    Some(reason),
                );
            }
            RawEvent::Error(message) if state == ConnectionState::Connecting => {
                self.destroy_connection(Some(connection_id), close_code::ABNORMAL, Some(message));
            }
            RawEvent::Error(message) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%message, "WebSocket error");
                self.emit(SocketEvent::Error(Arc::new(WsError::Socket(message).into())));
            }
            RawEvent::Drain(remaining) => {
                if remaining <= self.config.low_send_backpressure_mark {
                    self.transport.emit_send_backpressure_drain();
                }
            }
            RawEvent::Open => {}
        }
    }

    /// Tears the current connection down and moves to [`ConnectionState::Closed`].
    ///
    /// With `expected` set, does nothing unless that connection is still current. Returns the
    /// detached raw socket so callers can close it.
    fn destroy_connection(
        self: &Arc<Self>,
        expected: Option<u64>,
        code: u16,
        reason: Option<String>,
    ) -> Option<Arc<dyn RawSocket>> {
        let reason = resolve_close_reason(code, reason.as_deref());

        let (previous, raw, deferred) = {
            let mut session = self.session();
            if expected.is_some_and(|id| id != session.connection_id) {
                return None;
            }

            let previous = session.state;
            let raw = session.raw.take();
            session.connection_id = session.connection_id.wrapping_add(1);
            session.raw_open = false;
            session.connection_task = None;
            session.connect_ticker = None;
            session.ping_ticker = None;
            session.reconnect_ticker = None;
            let deferred = if previous == ConnectionState::Connecting {
                session.connect_deferred.clone()
            } else {
                None
            };
            self.set_state(&mut session, ConnectionState::Closed);
            self.schedule_reconnect(&mut session, code);

            (previous, raw, deferred)
        };

        match previous {
            ConnectionState::Open => {
                self.transport
                    .emit_bad_connection(BadConnectionKind::Disconnect);
                self.emit(SocketEvent::Disconnect { code, reason });
            }
            ConnectionState::Connecting => {
                self.transport
                    .emit_bad_connection(BadConnectionKind::ConnectAbort);
                if let Some(deferred) = deferred {
                    deferred.settle(Err(ConnectAbort::new(self.url.clone(), code, reason.clone())));
                }
                self.emit(SocketEvent::ConnectAbort { code, reason });
            }
            ConnectionState::Closed => {
                self.transport
                    .emit_bad_connection(BadConnectionKind::ConnectAbort);
            }
        }

        self.channels.suspend_all();
        raw
    }

    fn schedule_reconnect(self: &Arc<Self>, session: &mut Session, code: u16) {
        if !self.config.auto_reconnect.active {
            return;
        }

        let delay = match ReconnectDecision::for_code(code) {
            ReconnectDecision::Immediate => session.backoff.next_immediate(),
            ReconnectDecision::Backoff => {
                let Some(delay) = session.backoff.next_backoff() else {
                    return;
                };
                delay
            }
            ReconnectDecision::Never => return,
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(?delay, code, attempts = session.backoff.attempts(), "Scheduling reconnect");
        session.reconnect_ticker = Some(self.arm_ticker(session, TickerKind::Reconnect, delay));
    }

    pub(super) fn disconnect(self: &Arc<Self>, code: u16, reason: Option<&str>) {
        let open_connection = {
            let mut session = self.session();
            if session.state == ConnectionState::Open {
                Some(session.connection_id)
            } else {
                session.reconnect_ticker = None;
                None
            }
        };

        if let Some(connection_id) = open_connection
            && let Some(raw) =
                self.destroy_connection(Some(connection_id), code, reason.map(str::to_owned))
        {
            raw.close(code, reason);
        }
    }

    // Timers

    fn arm_ticker(self: &Arc<Self>, session: &mut Session, kind: TickerKind, delay: Duration) -> Ticker {
        session.ticker_seq = session.ticker_seq.wrapping_add(1);
        let id = session.ticker_seq;
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_ticker(kind, id);
            }
        });
        Ticker {
            id,
            _task: AbortOnDropHandle::new(task),
        }
    }

    fn on_ticker(self: &Arc<Self>, kind: TickerKind, id: u64) {
        let connection_id = {
            let mut session = self.session();
            let slot = match kind {
                TickerKind::Connect => &mut session.connect_ticker,
                TickerKind::Ping => &mut session.ping_ticker,
                TickerKind::Reconnect => &mut session.reconnect_ticker,
            };
            if slot.as_ref().is_none_or(|ticker| ticker.id != id) {
                return;
            }
            // Aborting the running task is a no-op, this callback never yields.
            *slot = None;
            session.connection_id
        };

        let code = match kind {
            TickerKind::Connect => close_code::CONNECT_TIMEOUT,
            TickerKind::Ping => close_code::SERVER_PING_TIMEOUT,
            TickerKind::Reconnect => {
                self.start_connect(None);
                return;
            }
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(?kind, url = %self.url, "Timer expired, closing connection");
        if let Some(raw) = self.destroy_connection(Some(connection_id), code, None) {
            raw.close(code, None);
        }
    }

    fn renew_ping(self: &Arc<Self>, session: &mut Session) {
        let timeout = session.ping_timeout;
        session.ping_ticker = Some(self.arm_ticker(session, TickerKind::Ping, timeout));
    }

    // Transport callbacks

    pub(crate) fn send_frame(self: &Arc<Self>, frame: Frame) -> Result<()> {
        let (raw, connection_id) = {
            let session = self.session();
            (session.raw.clone(), session.connection_id)
        };
        let raw = raw.ok_or(WsError::NotConnected)?;

        if let Err(e) = raw.send(frame) {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "Failed to write frame, closing connection");
            self.destroy_connection(Some(connection_id), close_code::ABNORMAL, Some(e.to_string()));
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn has_low_send_backpressure(&self) -> bool {
        let raw = self.session().raw.clone();
        raw.is_some_and(|raw| raw.buffered_amount() <= self.config.low_send_backpressure_mark)
    }

    pub(crate) fn on_transmit(self: &Arc<Self>, receiver: &str, data: Value, kind: DataKind) {
        match receiver {
            server_transmit::CONNECTION_READY => self.on_connection_ready(data),
            server_transmit::SET_AUTH_TOKEN => {
                let Value::String(signed) = data else {
                    self.on_listener_error(Error::validation("auth token push without a token"));
                    return;
                };
                if let Some(token) = extract_auth_token(&signed) {
                    self.set_auth(Some((token, signed.clone())), false);
                    self.queue_token_op(TokenOp::Save(SecretString::from(signed)));
                }
            }
            server_transmit::REMOVE_AUTH_TOKEN => {
                self.set_auth(None, false);
                self.queue_token_op(TokenOp::Remove);
            }
            server_transmit::KICK_OUT => match channel_payload(data) {
                Some((channel, data)) => {
                    self.channels.kick_out(&channel, data);
                }
                None => self.on_listener_error(Error::validation("malformed kick-out")),
            },
            server_transmit::PUBLISH => match channel_payload(data) {
                Some((channel, data)) => {
                    self.channels.publish(&channel, data, kind.is_complex());
                }
                None => self.on_listener_error(Error::validation("malformed publish")),
            },
            _ => {
                let handler = self
                    .receivers
                    .get(receiver)
                    .map(|handler| Arc::clone(handler.value()));
                if let Some(handler) = handler {
                    handler(data, kind);
                    return;
                }
                let fallback = self
                    .unknown_transmit
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if let Some(fallback) = fallback {
                    fallback(receiver, data, kind);
                }
            }
        }
    }

    pub(crate) fn on_invoke(&self, procedure: &str, data: Value, kind: DataKind, responder: Responder) {
        let handler = self
            .procedures
            .get(procedure)
            .map(|handler| Arc::clone(handler.value()));
        if let Some(handler) = handler {
            handler(data, kind, responder);
            return;
        }

        let fallback = self
            .unknown_invoke
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match fallback {
            Some(fallback) => fallback(procedure, data, kind, responder),
            None => {
                #[cfg(feature = "tracing")]
                tracing::debug!(%procedure, "No handler for invoked procedure");
            }
        }
    }

    pub(crate) fn on_ping(self: &Arc<Self>) {
        {
            let mut session = self.session();
            if session.state == ConnectionState::Closed {
                return;
            }
            self.renew_ping(&mut session);
        }
        self.transport.send_pong();
    }

    pub(crate) fn on_listener_error(&self, error: Error) {
        #[cfg(feature = "tracing")]
        tracing::warn!(%error, "Listener failed");
        self.emit(SocketEvent::Error(Arc::new(error)));
    }

    pub(crate) fn on_invalid_message(self: &Arc<Self>) {
        #[cfg(feature = "tracing")]
        tracing::warn!(url = %self.url, "Received an invalid message, closing connection");
        if let Some(raw) = self.destroy_connection(
            None,
            close_code::BAD_MESSAGE,
            Some(BAD_MESSAGE_REASON.to_owned()),
        ) {
            raw.close(close_code::BAD_MESSAGE, Some(BAD_MESSAGE_REASON));
        }
    }

    fn on_connection_ready(self: &Arc<Self>, data: Value) {
        {
            let session = self.session();
            if session.state != ConnectionState::Connecting || !session.raw_open {
                return;
            }
        }

        let Some((ping_interval, auth_state, ready)) = parse_ready(data) else {
            self.on_invalid_message();
            return;
        };

        if let Some(code) = auth_state {
            self.set_auth(None, false);
            if AuthTokenState::from_code(code).removes_token() {
                self.queue_token_op(TokenOp::Remove);
            }
        }

        let (deferred, connection_id) = {
            let mut session = self.session();
            if session.state != ConnectionState::Connecting {
                return;
            }
            session.ping_timeout = ping_interval + PING_GRACE;
            session.backoff.reset();
            session.connect_ticker = None;
            self.renew_ping(&mut session);
            self.set_state(&mut session, ConnectionState::Open);
            (session.connect_deferred.clone(), session.connection_id)
        };

        self.transport.emit_open();
        if let Some(deferred) = deferred {
            deferred.settle(Ok(ready));
        }
        self.emit(SocketEvent::Connect);

        if self.config.auto_resubscribe {
            self.resume_subscriptions(Some(connection_id));
        } else {
            self.transport.flush_buffer();
        }
    }

    // Calls

    fn canceller(&self, package: PreparedPackage) -> impl Fn() -> bool + Send + Sync + 'static {
        let transport = Arc::clone(&self.transport);
        move || transport.try_cancel_package(&package)
    }

    pub(super) fn transmit(self: &Arc<Self>, receiver: &str, data: Value, options: &CallOptions) -> Call<()> {
        let send_timeout = options
            .send_timeout
            .resolve(self.config.transmit_send_timeout);
        let package = self
            .transport
            .prepare_transmit(receiver, data, &options.package_options());
        self.connect_unless_open();

        let sent = self
            .transport
            .send_prepared_package_with_promise(&package, options.batch);
        if !options.cancelable && send_timeout.is_none() {
            return Call::Plain(sent);
        }

        let canceller = self.canceller(package);
        let Some(timeout) = send_timeout else {
            return Call::Cancelable(CancelablePromise::new(sent, canceller));
        };

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let promise = CancelablePromise::new(
            async move {
                outcome_rx
                    .await
                    .unwrap_or_else(|_closed| Err(Error::cancellation()))
            },
            canceller,
        );
        let handle = promise.cancel_handle();
        tokio::spawn(async move {
            if let Some(outcome) = race_send_timeout(handle, sent, timeout, TRANSMIT_SEND_TIMEOUT).await {
                _ = outcome_tx.send(outcome);
            }
        });
        Call::Cancelable(promise)
    }

    pub(super) fn invoke(self: &Arc<Self>, procedure: &str, data: Value, options: &CallOptions) -> Call<Value> {
        let send_timeout = options
            .send_timeout
            .resolve(self.config.invoke_send_timeout);
        let PreparedInvoke { package, response } =
            self.transport
                .prepare_invoke(procedure, data, &options.package_options());
        self.connect_unless_open();

        if let Some(timeout) = send_timeout {
            let sent = self
                .transport
                .send_prepared_package_with_promise(&package, options.batch);
            let promise = CancelablePromise::new(response, self.canceller(package));
            let handle = promise.cancel_handle();
            tokio::spawn(async move {
                _ = race_send_timeout(handle, sent, timeout, INVOKE_SEND_TIMEOUT).await;
            });
            return Call::Cancelable(promise);
        }

        self.transport
            .send_prepared_package(&package, options.batch);
        if options.cancelable {
            Call::Cancelable(CancelablePromise::new(response, self.canceller(package)))
        } else {
            Call::Plain(response)
        }
    }

    pub(super) fn publish(self: &Arc<Self>, channel: &str, data: Value, options: &CallOptions) -> Call<()> {
        let payload = json!([channel, data]);
        if options.ack {
            self.invoke(server_procedure::PUBLISH, payload, options)
                .map_ok(drop)
        } else {
            self.transmit(server_receiver::PUBLISH, payload, options)
        }
    }

    // Channels

    /// Issues a subscribe request unless the channel is already subscribed. The returned
    /// task confirms the channel once the server acknowledges.
    pub(super) fn subscribe(self: &Arc<Self>, channel: &str, options: &CallOptions) -> Option<JoinHandle<Result<()>>> {
        self.connect_unless_open();
        let connection_id = self.session().connection_id;
        let attempt = self.channels.begin_subscribe(channel, connection_id)?;

        let call = self.invoke(
            server_procedure::SUBSCRIBE,
            Value::String(channel.to_owned()),
            options,
        );
        let inner = Arc::clone(self);
        let channel = channel.to_owned();
        Some(tokio::spawn(async move {
            let result = call.await.map(drop);
            inner.finish_subscribe(&channel, connection_id, attempt, result.is_ok());
            result
        }))
    }

    /// Confirms an acknowledged subscribe only while the connection it was issued on is open.
    fn finish_subscribe(&self, channel: &str, connection_id: u64, attempt: u64, acknowledged: bool) {
        // Held across the registry update so a concurrent destroy either suspends the
        // confirmed channel afterwards or has already made this ack stale.
        let session = self.session();
        let live = session.state == ConnectionState::Open && session.connection_id == connection_id;
        self.channels
            .finish_subscribe(channel, attempt, acknowledged && live);
    }

    pub(super) fn unsubscribe(
        self: &Arc<Self>,
        channel: &str,
        options: &CallOptions,
    ) -> impl Future<Output = Result<()>> + Send + use<> {
        let call = self.channels.state(channel).is_some().then(|| {
            self.transmit(
                server_receiver::UNSUBSCRIBE,
                Value::String(channel.to_owned()),
                options,
            )
        });
        self.channels.remove(channel);

        async move {
            match call {
                Some(call) => call.await,
                None => Ok(()),
            }
        }
    }

    /// Re-issues pending channels with an indefinite batch, then flushes once.
    ///
    /// `buffered_on` is the connection that just opened; requests still buffered for it are
    /// not duplicated. An auth change passes `None` and retries every pending channel.
    fn resume_subscriptions(self: &Arc<Self>, buffered_on: Option<u64>) {
        let options = CallOptions::builder()
            .batch(Batch::Indefinite)
            .build();
        for channel in self.channels.resumable(buffered_on) {
            // Failures leave the channel pending for the next resumption.
            drop(self.subscribe(&channel, &options));
        }
        self.transport.flush_buffer();
    }

    // Auth

    fn set_auth(self: &Arc<Self>, next: Option<(Value, String)>, self_initiated: bool) {
        let Some(change) = self.auth.replace(next) else {
            return;
        };
        self.emit(SocketEvent::AuthTokenChange {
            new: change.new,
            old: change.old,
            self_initiated,
        });
        self.resume_subscriptions(None);
    }

    fn queue_token_op(&self, op: TokenOp) {
        _ = self.token_ops.send(op);
    }

    pub(super) fn authenticate(self: &Arc<Self>, signed_token: String, options: &CallOptions) -> Call<()> {
        let call = self.invoke(
            server_procedure::AUTHENTICATE,
            Value::String(signed_token.clone()),
            options,
        );
        let handle = call.cancel_handle();

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            call.await?;
            if let Some(token) = extract_auth_token(&signed_token) {
                inner.set_auth(Some((token, signed_token.clone())), true);
            }
            inner.queue_token_op(TokenOp::Save(SecretString::from(signed_token)));
            Ok::<(), Error>(())
        });
        let outcome = async move { task.await? };

        match handle {
            Some(handle) if options.cancelable => {
                Call::Cancelable(CancelablePromise::new(outcome, move || handle.cancel()))
            }
            _ => Call::Plain(Box::pin(outcome)),
        }
    }

    pub(super) fn deauthenticate(self: &Arc<Self>) -> impl Future<Output = ()> + Send + use<> {
        let call = (self.state() == ConnectionState::Open).then(|| {
            self.transmit(
                server_receiver::DEAUTHENTICATE,
                Value::Null,
                &CallOptions::default(),
            )
        });
        self.set_auth(None, true);
        self.queue_token_op(TokenOp::Remove);

        async move {
            if let Some(call) = call
                && let Err(e) = call.await
            {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %e, "Deauthenticate notification failed");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }
    }
}

/// Applies token store writes in the order they were queued.
fn spawn_token_worker(engine: Arc<TokenStoreEngine>) -> mpsc::UnboundedSender<TokenOp> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            match op {
                TokenOp::Save(signed) => engine.save_token(signed.expose_secret()).await,
                TokenOp::Remove => engine.remove_token().await,
            }
        }
    });
    tx
}

/// Splits a `[ping_interval_ms, auth_token_state, ready_payload]` ready transmit.
fn parse_ready(data: Value) -> Option<(Duration, Option<u64>, Value)> {
    let Value::Array(items) = data else {
        return None;
    };
    let mut items = items.into_iter();
    let ping_interval = items.next()?.as_u64()?;
    let auth_state = items.next().and_then(|state| state.as_u64());
    let ready = items.next().unwrap_or_default();
    Some((Duration::from_millis(ping_interval), auth_state, ready))
}

/// Splits a `[channel, data]` payload.
fn channel_payload(data: Value) -> Option<(String, Value)> {
    let Value::Array(items) = data else {
        return None;
    };
    let mut items = items.into_iter();
    let Value::String(channel) = items.next()? else {
        return None;
    };
    Some((channel, items.next().unwrap_or_default()))
}
