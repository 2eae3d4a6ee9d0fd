#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Each integration test binary uses a different subset of the helpers"
)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use pubsub_socket::Result;
use pubsub_socket::config::{AutoReconnect, Config};
use pubsub_socket::error::Error;
use pubsub_socket::protocol::{BadConnectionKind, DataKind};
use pubsub_socket::socket::Socket;
use pubsub_socket::transport::{
    Batch, PackageOptions, PreparedInvoke, PreparedPackage, Responder, Transport, TransportLink,
    TransportSettings,
};
use pubsub_socket::ws::{Connector, Frame, HandshakeRequest, RawEvent, RawEvents, RawSocket, WsError};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};

/// Ping interval announced by [`MockConnection::ready`].
pub const PING_INTERVAL_MS: u64 = 30_000;

/// Lets spawned tasks run without advancing the paused clock.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Config with deterministic reconnect delays of 5s, 7.5s, 11.25s...
#[must_use]
pub fn config() -> Config {
    let mut config = Config::default();
    config.auto_reconnect.randomness = Duration::ZERO;
    config
}

#[must_use]
pub fn config_without_reconnect() -> Config {
    let mut config = Config::default();
    config.auto_reconnect = AutoReconnect::disabled();
    config
}

pub struct Harness {
    pub socket: Socket,
    pub transport: Arc<MockTransport>,
    pub connector: Arc<MockConnector>,
}

impl Harness {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let transport = Arc::new(MockTransport::default());
        let connector = Arc::new(MockConnector::default());
        let socket = Socket::with_connector(
            config,
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&connector) as Arc<dyn Connector>,
        );
        Self {
            socket,
            transport,
            connector,
        }
    }

    /// Connects and completes the handshake with `ready` as ready payload.
    pub async fn open_with(&self, ready: Value) -> Value {
        let connecting = self.socket.connect(None);
        settle().await;
        let connection = self.connector.last();
        connection.open();
        connection.ready(PING_INTERVAL_MS, None, ready);
        let ready = connecting.await.unwrap();
        settle().await;
        ready
    }

    pub async fn open(&self) -> Arc<MockConnection> {
        self.open_with(Value::Null).await;
        self.connector.last()
    }

    /// Handshakes the latest connection opened by a reconnect.
    pub async fn complete_reconnect(&self) -> Arc<MockConnection> {
        settle().await;
        let connection = self.connector.last();
        connection.open();
        connection.ready(PING_INTERVAL_MS, None, Value::Null);
        settle().await;
        connection
    }
}

/// Signed token with `payload` as its middle segment.
#[must_use]
pub fn signed_token(payload: &Value) -> String {
    use base64::Engine as _;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    format!(
        "eyJhbGciOiJIUzI1NiJ9.{}.c2lnbmF0dXJl",
        URL_SAFE_NO_PAD.encode(payload.to_string())
    )
}

// Transport

struct Outbound {
    frame: Value,
}

#[derive(Default)]
struct TransportState {
    next_id: u64,
    open: bool,
    packages: HashMap<u64, Outbound>,
    buffer: Vec<u64>,
    written: Vec<Value>,
    acks: HashMap<u64, oneshot::Sender<Result<Value>>>,
    write_waiters: HashMap<u64, oneshot::Sender<Result<()>>>,
    bad_connections: Vec<BadConnectionKind>,
    flushes: usize,
}

/// JSON package layer: `{"t": "transmit", "r", "d"}`, `{"t": "invoke", "p", "id", "d"}`,
/// `{"t": "ack", "id", "d"}`, `{"t": "reject", "id", "e"}` and `"ping"`.
#[derive(Default)]
pub struct MockTransport {
    link: Mutex<Option<TransportLink>>,
    settings: Mutex<Option<TransportSettings>>,
    state: Mutex<TransportState>,
    pongs: AtomicUsize,
    drains: AtomicUsize,
}

impl MockTransport {
    fn link(&self) -> TransportLink {
        self.link.lock().unwrap().clone().unwrap()
    }

    #[must_use]
    pub fn settings(&self) -> Option<TransportSettings> {
        *self.settings.lock().unwrap()
    }

    fn prepare(&self, frame: impl FnOnce(u64) -> Value) -> PreparedPackage {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.packages.insert(id, Outbound { frame: frame(id) });
        PreparedPackage::new(id)
    }

    fn write(&self, id: u64) {
        let Some(outbound) = self.state.lock().unwrap().packages.remove(&id) else {
            return;
        };
        let result = self
            .link()
            .send(Frame::Text(outbound.frame.to_string()));

        let mut state = self.state.lock().unwrap();
        if result.is_ok() {
            state.written.push(outbound.frame);
        }
        if let Some(waiter) = state.write_waiters.remove(&id) {
            drop(waiter.send(result));
        }
    }

    /// Packages written to the socket so far.
    #[must_use]
    pub fn written(&self) -> Vec<Value> {
        self.state.lock().unwrap().written.clone()
    }

    /// Written packages addressed to `name`, as receiver or procedure.
    #[must_use]
    pub fn written_to(&self, name: &str) -> Vec<Value> {
        self.written()
            .into_iter()
            .filter(|frame| frame["r"] == name || frame["p"] == name)
            .collect()
    }

    /// Id of the most recent written invocation of `procedure`.
    #[must_use]
    pub fn last_invoke(&self, procedure: &str) -> Option<u64> {
        self.written()
            .iter()
            .rev()
            .find(|frame| frame["t"] == "invoke" && frame["p"] == procedure)
            .and_then(|frame| frame["id"].as_u64())
    }

    pub fn ack(&self, id: u64, data: Value) {
        let waiter = self.state.lock().unwrap().acks.remove(&id).unwrap();
        drop(waiter.send(Ok(data)));
    }

    pub fn reject(&self, id: u64, error: Value) {
        let waiter = self.state.lock().unwrap().acks.remove(&id).unwrap();
        drop(waiter.send(Err(Error::remote(error))));
    }

    #[must_use]
    pub fn bad_connections(&self) -> Vec<BadConnectionKind> {
        self.state.lock().unwrap().bad_connections.clone()
    }

    #[must_use]
    pub fn flushes(&self) -> usize {
        self.state.lock().unwrap().flushes
    }

    #[must_use]
    pub fn pongs(&self) -> usize {
        self.pongs.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn drains(&self) -> usize {
        self.drains.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }
}

impl Transport for MockTransport {
    fn attach(&self, link: TransportLink, settings: TransportSettings) {
        *self.link.lock().unwrap() = Some(link);
        *self.settings.lock().unwrap() = Some(settings);
    }

    fn prepare_transmit(&self, receiver: &str, data: Value, _options: &PackageOptions) -> PreparedPackage {
        self.prepare(|_id| json!({"t": "transmit", "r": receiver, "d": data}))
    }

    fn prepare_invoke(&self, procedure: &str, data: Value, _options: &PackageOptions) -> PreparedInvoke {
        let package = self.prepare(|id| json!({"t": "invoke", "p": procedure, "id": id, "d": data}));
        let (tx, rx) = oneshot::channel();
        self.state
            .lock()
            .unwrap()
            .acks
            .insert(package.id(), tx);
        let response = Box::pin(async move {
            rx.await
                .unwrap_or_else(|_closed| Err(WsError::ConnectionClosed.into()))
        });
        PreparedInvoke::new(package, response)
    }

    fn send_prepared_package(&self, package: &PreparedPackage, batch: Option<Batch>) {
        let write_now = {
            let mut state = self.state.lock().unwrap();
            let write_now = state.open && batch.is_none();
            if !write_now {
                state.buffer.push(package.id());
            }
            write_now
        };
        if write_now {
            self.write(package.id());
        }
    }

    fn send_prepared_package_with_promise(
        &self,
        package: &PreparedPackage,
        batch: Option<Batch>,
    ) -> BoxFuture<'static, Result<()>> {
        let (tx, rx) = oneshot::channel();
        self.state
            .lock()
            .unwrap()
            .write_waiters
            .insert(package.id(), tx);
        self.send_prepared_package(package, batch);
        Box::pin(async move { rx.await.unwrap_or_else(|_closed| Err(Error::cancellation())) })
    }

    fn try_cancel_package(&self, package: &PreparedPackage) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(position) = state.buffer.iter().position(|id| *id == package.id()) else {
            return false;
        };
        state.buffer.remove(position);
        state.packages.remove(&package.id());
        state.write_waiters.remove(&package.id());
        state.acks.remove(&package.id());
        true
    }

    fn flush_buffer(&self) {
        let buffered = {
            let mut state = self.state.lock().unwrap();
            state.flushes += 1;
            if !state.open {
                return;
            }
            std::mem::take(&mut state.buffer)
        };
        for id in buffered {
            self.write(id);
        }
    }

    fn buffer_size(&self) -> usize {
        self.state.lock().unwrap().buffer.len()
    }

    fn emit_message(&self, frame: Frame) {
        let link = self.link();
        let Frame::Text(text) = frame else {
            link.on_invalid_message();
            return;
        };
        let Ok(message) = serde_json::from_str::<Value>(&text) else {
            link.on_invalid_message();
            return;
        };

        match message["t"].as_str() {
            _ if message == "ping" => link.on_ping(),
            Some("transmit") => {
                let receiver = message["r"].as_str().unwrap_or_default();
                link.on_transmit(receiver, message["d"].clone(), DataKind::Json);
            }
            Some("invoke") => {
                let procedure = message["p"].as_str().unwrap_or_default();
                let id = message["id"].clone();
                let (responder, answer) = Responder::channel();
                link.on_invoke(procedure, message["d"].clone(), DataKind::Json, responder);
                let link = link.clone();
                tokio::spawn(async move {
                    let frame = match answer.await {
                        Ok(Ok(data)) => json!({"t": "response", "id": id, "d": data}),
                        Ok(Err(err)) => json!({"t": "response", "id": id, "e": err}),
                        Err(_dropped) => return,
                    };
                    drop(link.send(Frame::Text(frame.to_string())));
                });
            }
            Some("ack") => {
                if let Some(id) = message["id"].as_u64() {
                    self.ack(id, message["d"].clone());
                }
            }
            Some("reject") => {
                if let Some(id) = message["id"].as_u64() {
                    self.reject(id, message["e"].clone());
                }
            }
            _ => link.on_invalid_message(),
        }
    }

    fn emit_open(&self) {
        self.state.lock().unwrap().open = true;
    }

    fn emit_bad_connection(&self, kind: BadConnectionKind) {
        let acks = {
            let mut state = self.state.lock().unwrap();
            state.open = false;
            state.bad_connections.push(kind);
            // Written invocations can no longer be answered; buffered ones wait for a reconnect.
            let buffered = state.buffer.clone();
            let dead: Vec<u64> = state
                .acks
                .keys()
                .copied()
                .filter(|id| !buffered.contains(id))
                .collect();
            dead.into_iter()
                .filter_map(|id| state.acks.remove(&id))
                .collect::<Vec<_>>()
        };
        for ack in acks {
            drop(ack.send(Err(WsError::ConnectionClosed.into())));
        }
    }

    fn emit_send_backpressure_drain(&self) {
        self.drains.fetch_add(1, Ordering::SeqCst);
    }

    fn send_pong(&self) {
        self.pongs.fetch_add(1, Ordering::SeqCst);
        drop(self.link().send(Frame::Text("\"pong\"".to_owned())));
    }
}

// Connector

#[derive(Default)]
pub struct MockRawSocket {
    sent: Mutex<Vec<Frame>>,
    closed: Mutex<Option<(u16, Option<String>)>>,
    buffered: AtomicUsize,
    fail_sends: AtomicBool,
}

impl MockRawSocket {
    #[must_use]
    pub fn sent(&self) -> Vec<Frame> {
        self.sent.lock().unwrap().clone()
    }

    #[must_use]
    pub fn closed(&self) -> Option<(u16, Option<String>)> {
        self.closed.lock().unwrap().clone()
    }

    pub fn set_buffered(&self, amount: usize) {
        self.buffered.store(amount, Ordering::SeqCst);
    }

    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }
}

impl RawSocket for MockRawSocket {
    fn send(&self, frame: Frame) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(WsError::Socket("broken pipe".to_owned()).into());
        }
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    fn close(&self, code: u16, reason: Option<&str>) {
        *self.closed.lock().unwrap() = Some((code, reason.map(str::to_owned)));
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }
}

pub struct MockConnection {
    pub request: HandshakeRequest,
    pub raw: Arc<MockRawSocket>,
    events: mpsc::UnboundedSender<RawEvent>,
}

impl MockConnection {
    pub fn emit(&self, event: RawEvent) {
        drop(self.events.send(event));
    }

    pub fn open(&self) {
        self.emit(RawEvent::Open);
    }

    pub fn ready(&self, ping_interval_ms: u64, auth_state: Option<u8>, data: Value) {
        self.transmit(
            "#connectionReady",
            json!([ping_interval_ms, auth_state, data]),
        );
    }

    /// Delivers a server transmit to the session.
    pub fn transmit(&self, receiver: &str, data: Value) {
        self.text(json!({"t": "transmit", "r": receiver, "d": data}));
    }

    pub fn text(&self, message: Value) {
        self.emit(RawEvent::Message(Frame::Text(message.to_string())));
    }

    pub fn ping(&self) {
        self.text(json!("ping"));
    }

    pub fn close(&self, code: Option<u16>, reason: &str) {
        self.emit(RawEvent::Close {
            code,
            reason: reason.to_owned(),
        });
    }
}

#[derive(Default)]
pub struct MockConnector {
    connections: Mutex<Vec<Arc<MockConnection>>>,
    refuse: AtomicBool,
}

impl MockConnector {
    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    #[must_use]
    pub fn last(&self) -> Arc<MockConnection> {
        Arc::clone(self.connections.lock().unwrap().last().unwrap())
    }

    /// Makes every further `create_connection` fail.
    pub fn refuse(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }
}

impl Connector for MockConnector {
    fn create_connection(&self, request: &HandshakeRequest) -> Result<(Arc<dyn RawSocket>, RawEvents)> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(WsError::Handshake("connection refused".to_owned()).into());
        }
        let (events, rx) = mpsc::unbounded_channel();
        let raw = Arc::new(MockRawSocket::default());
        self.connections
            .lock()
            .unwrap()
            .push(Arc::new(MockConnection {
                request: request.clone(),
                raw: Arc::clone(&raw),
                events,
            }));
        Ok((raw, rx))
    }
}
