//! Minimal chat client.
//!
//! Connects to a server speaking a plain JSON package format, joins the `chat` channel,
//! publishes one message and logs everything published to the channel for a while.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=info cargo run --example chat --features tracing -- ws://localhost:3000
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt as _;
use futures::future::BoxFuture;
use pubsub_socket::call::CallOptions;
use pubsub_socket::config::Config;
use pubsub_socket::error::{Error, TimeoutOrigin};
use pubsub_socket::events::ChannelEvent;
use pubsub_socket::protocol::{BadConnectionKind, DataKind};
use pubsub_socket::socket::Socket;
use pubsub_socket::transport::{
    Batch, PackageOptions, PreparedInvoke, PreparedPackage, Responder, Transport, TransportLink,
    TransportSettings,
};
use pubsub_socket::ws::{Frame, WsError};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{info, warn};

type Ack = oneshot::Sender<pubsub_socket::Result<Value>>;

/// Writes every package as soon as the socket is open; no batching.
#[derive(Default)]
struct JsonTransport {
    link: Mutex<Option<TransportLink>>,
    ack_timeout: Mutex<Duration>,
    open: AtomicBool,
    next_id: AtomicU64,
    prepared: Mutex<HashMap<u64, String>>,
    buffer: Mutex<Vec<(u64, Option<oneshot::Sender<pubsub_socket::Result<()>>>)>>,
    acks: Mutex<HashMap<u64, Ack>>,
}

impl JsonTransport {
    fn link(&self) -> Option<TransportLink> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn prepare(&self, package: Value) -> PreparedPackage {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut package = package;
        package["id"] = json!(id);
        self.prepared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, package.to_string());
        PreparedPackage::new(id)
    }

    fn write(&self, id: u64, written: Option<oneshot::Sender<pubsub_socket::Result<()>>>) {
        let text = self
            .prepared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        let result = match (text, self.link()) {
            (Some(text), Some(link)) => link.send(Frame::Text(text)),
            _ => Err(WsError::NotConnected.into()),
        };
        if let Some(written) = written {
            _ = written.send(result);
        }
    }

    fn enqueue(&self, package: &PreparedPackage, written: Option<oneshot::Sender<pubsub_socket::Result<()>>>) {
        if self.open.load(Ordering::SeqCst) {
            self.write(package.id(), written);
        } else {
            self.buffer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((package.id(), written));
        }
    }
}

impl Transport for JsonTransport {
    fn attach(&self, link: TransportLink, settings: TransportSettings) {
        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(link);
        *self.ack_timeout.lock().unwrap_or_else(PoisonError::into_inner) = settings.ack_timeout;
    }

    fn prepare_transmit(&self, receiver: &str, data: Value, _options: &PackageOptions) -> PreparedPackage {
        self.prepare(json!({"t": "transmit", "r": receiver, "d": data}))
    }

    fn prepare_invoke(&self, procedure: &str, data: Value, options: &PackageOptions) -> PreparedInvoke {
        let package = self.prepare(json!({"t": "invoke", "p": procedure, "d": data}));
        let (tx, rx) = oneshot::channel();
        self.acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(package.id(), tx);

        let ack_timeout = options
            .ack_timeout
            .unwrap_or(*self.ack_timeout.lock().unwrap_or_else(PoisonError::into_inner));
        let response = Box::pin(async move {
            match timeout(ack_timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_closed)) => Err(WsError::ConnectionClosed.into()),
                Err(_elapsed) => Err(Error::timeout("Response timeout reached.", TimeoutOrigin::AckTimeout)),
            }
        });
        PreparedInvoke::new(package, response)
    }

    fn send_prepared_package(&self, package: &PreparedPackage, _batch: Option<Batch>) {
        self.enqueue(package, None);
    }

    fn send_prepared_package_with_promise(
        &self,
        package: &PreparedPackage,
        _batch: Option<Batch>,
    ) -> BoxFuture<'static, pubsub_socket::Result<()>> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(package, Some(tx));
        Box::pin(async move { rx.await.unwrap_or_else(|_closed| Err(Error::cancellation())) })
    }

    fn try_cancel_package(&self, package: &PreparedPackage) -> bool {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let before = buffer.len();
        buffer.retain(|(id, _)| *id != package.id());
        buffer.len() != before
    }

    fn flush_buffer(&self) {
        let buffered = std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner));
        for (id, written) in buffered {
            self.write(id, written);
        }
    }

    fn buffer_size(&self) -> usize {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn emit_message(&self, frame: Frame) {
        let Some(link) = self.link() else {
            return;
        };
        let Frame::Text(text) = frame else {
            link.on_invalid_message();
            return;
        };
        let Ok(message) = serde_json::from_str::<Value>(&text) else {
            link.on_invalid_message();
            return;
        };

        match message["t"].as_str() {
            Some("ping") => link.on_ping(),
            Some("transmit") => {
                let receiver = message["r"].as_str().unwrap_or_default();
                link.on_transmit(receiver, message["d"].clone(), DataKind::Json);
            }
            Some("invoke") => {
                let (responder, _answer) = Responder::channel();
                let procedure = message["p"].as_str().unwrap_or_default();
                link.on_invoke(procedure, message["d"].clone(), DataKind::Json, responder);
            }
            Some("response") => {
                let ack = message["id"]
                    .as_u64()
                    .and_then(|id| self.acks.lock().unwrap_or_else(PoisonError::into_inner).remove(&id));
                if let Some(ack) = ack {
                    let result = match message.get("e") {
                        Some(err) => Err(Error::remote(err.clone())),
                        None => Ok(message["d"].clone()),
                    };
                    _ = ack.send(result);
                }
            }
            _ => link.on_invalid_message(),
        }
    }

    fn emit_open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    fn emit_bad_connection(&self, _kind: BadConnectionKind) {
        self.open.store(false, Ordering::SeqCst);
        self.acks.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn emit_send_backpressure_drain(&self) {}

    fn send_pong(&self) {
        if let Some(link) = self.link() {
            _ = link.send(Frame::Text(json!({"t": "pong"}).to_string()));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:3000".to_owned());
    let socket = Socket::new(Config::from_url(&url)?, Arc::new(JsonTransport::default()));

    let ready = socket.connect(None).await?;
    info!(%url, %ready, "Connected");

    let mut events = Box::pin(socket.channel_events("chat"));
    socket.subscribe("chat", &CallOptions::default()).await?;
    socket
        .publish("chat", json!({"text": "hello"}), &CallOptions::default())
        .await?;

    while let Ok(Some(event)) = timeout(Duration::from_secs(30), events.next()).await {
        match event {
            Ok(ChannelEvent::Publish { data, .. }) => info!(channel = "chat", %data),
            Ok(event) => info!(channel = "chat", ?event),
            Err(e) => warn!(channel = "chat", error = %e),
        }
    }

    socket.disconnect(1000, None);
    Ok(())
}
