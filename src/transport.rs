#![expect(
    clippy::module_name_repetitions,
    reason = "Transport types carry the module name to tell them apart from socket-level types"
)]

//! Package layer seam.
//!
//! A [`Transport`] owns package framing, the send buffer and acknowledgement tracking. The
//! session hands it prepared packages and inbound frames; the transport calls back into the
//! session through the [`TransportLink`] it receives in [`Transport::attach`].

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::Result;
use crate::error::Error;
use crate::protocol::{BadConnectionKind, DataKind};
use crate::socket::session::Inner;
use crate::ws::Frame;

/// Opaque handle to a package prepared by a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PreparedPackage {
    id: u64,
}

impl PreparedPackage {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self { id }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }
}

/// A prepared invocation and the future that resolves with its acknowledgement.
#[non_exhaustive]
pub struct PreparedInvoke {
    pub package: PreparedPackage,
    /// Resolves with the response data, a remote rejection or an ack timeout
    pub response: BoxFuture<'static, Result<Value>>,
}

impl PreparedInvoke {
    #[must_use]
    pub fn new(package: PreparedPackage, response: BoxFuture<'static, Result<Value>>) -> Self {
        Self { package, response }
    }
}

impl fmt::Debug for PreparedInvoke {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedInvoke")
            .field("package", &self.package)
            .finish_non_exhaustive()
    }
}

/// Per-package options.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackageOptions {
    /// Overrides the transport's ack timeout for an invocation
    pub ack_timeout: Option<Duration>,
    /// The data may contain binary parts
    pub complex_types: bool,
}

/// How long a package may wait in the send buffer to be batched with others.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Batch {
    Window(Duration),
    /// Until the buffer is flushed explicitly
    Indefinite,
}

/// Settings handed to the transport on attach.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    pub ack_timeout: Duration,
    pub max_package_buffer_size: Option<usize>,
}

/// Package layer used by a [`Socket`](crate::socket::Socket).
///
/// Every method is called without any session lock held, so implementations may call back
/// into the [`TransportLink`] synchronously.
pub trait Transport: Send + Sync {
    fn attach(&self, link: TransportLink, settings: TransportSettings);

    fn prepare_transmit(&self, receiver: &str, data: Value, options: &PackageOptions) -> PreparedPackage;

    fn prepare_invoke(&self, procedure: &str, data: Value, options: &PackageOptions) -> PreparedInvoke;

    /// Sends or buffers `package`. Packages are buffered while the connection is not open.
    fn send_prepared_package(&self, package: &PreparedPackage, batch: Option<Batch>);

    /// Like [`Transport::send_prepared_package`], dispatching before it returns. The future
    /// resolves once the package was written to the socket.
    fn send_prepared_package_with_promise(
        &self,
        package: &PreparedPackage,
        batch: Option<Batch>,
    ) -> BoxFuture<'static, Result<()>>;

    /// Withdraws a still-buffered package. Returns `false` once it has left the buffer.
    fn try_cancel_package(&self, package: &PreparedPackage) -> bool;

    fn flush_buffer(&self);

    fn buffer_size(&self) -> usize;

    fn emit_message(&self, frame: Frame);

    fn emit_open(&self);

    /// Called after every connection loss; pending acknowledgements should be rejected.
    fn emit_bad_connection(&self, kind: BadConnectionKind);

    fn emit_send_backpressure_drain(&self);

    fn send_pong(&self);
}

/// One-shot answer to an inbound invocation.
///
/// Dropping it unanswered closes the channel the transport waits on.
#[derive(Debug)]
pub struct Responder {
    tx: oneshot::Sender<std::result::Result<Value, Value>>,
}

impl Responder {
    /// Creates a responder and the receiver the transport awaits the answer on.
    #[must_use]
    pub fn channel() -> (Self, oneshot::Receiver<std::result::Result<Value, Value>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn end(self, data: Value) {
        _ = self.tx.send(Ok(data));
    }

    pub fn reject(self, err: Value) {
        _ = self.tx.send(Err(err));
    }
}

/// The transport's way back into the session it is attached to.
///
/// Holds only a weak reference; every method is a no-op once the socket is dropped.
#[derive(Clone)]
pub struct TransportLink {
    inner: Weak<Inner>,
}

impl fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportLink")
            .field("attached", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl TransportLink {
    pub(crate) fn new(inner: &Arc<Inner>) -> Self {
        Self {
            inner: Arc::downgrade(inner),
        }
    }

    /// Writes a frame to the current raw socket. A failed write destroys the connection.
    pub fn send(&self, frame: Frame) -> Result<()> {
        self.inner
            .upgrade()
            .ok_or(crate::ws::WsError::ConnectionClosed)?
            .send_frame(frame)
    }

    /// Whether the raw socket's send buffer is at or below the low-water mark.
    #[must_use]
    pub fn has_low_send_backpressure(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.has_low_send_backpressure())
    }

    pub fn on_transmit(&self, receiver: &str, data: Value, kind: DataKind) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_transmit(receiver, data, kind);
        }
    }

    pub fn on_invoke(&self, procedure: &str, data: Value, kind: DataKind, responder: Responder) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_invoke(procedure, data, kind, responder);
        }
    }

    pub fn on_ping(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_ping();
        }
    }

    /// Reports an error raised by a receiver or procedure handler.
    pub fn on_listener_error(&self, error: Error) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_listener_error(error);
        }
    }

    /// Reports an inbound frame that is not a valid package. Closes the connection.
    pub fn on_invalid_message(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_invalid_message();
        }
    }
}
