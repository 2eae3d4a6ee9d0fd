//! Socket lifecycle events and per-channel event fan-out.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_stream::try_stream;
use dashmap::DashMap;
use futures::Stream;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::Result;
use crate::error::{Error, TimeoutOrigin};
use crate::protocol::UnsubscribeReason;
use crate::ws::WsError;

/// Broadcast channel capacity for socket and channel events.
pub(crate) const EVENT_CAPACITY: usize = 1024;

/// Connection and auth lifecycle events.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// The connection is open and the server signalled readiness
    Connect,
    /// A connect attempt ended before the connection opened
    ConnectAbort { code: u16, reason: String },
    /// An open connection was closed
    Disconnect { code: u16, reason: String },
    /// The decoded auth token changed
    AuthTokenChange {
        new: Option<Value>,
        old: Option<Value>,
        /// The change was initiated by this client rather than pushed by the server
        self_initiated: bool,
    },
    /// An error that occurred outside any caller's call
    Error(Arc<Error>),
}

/// Events scoped to a single channel.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Subscribe,
    Unsubscribe {
        reason: UnsubscribeReason,
        data: Option<Value>,
    },
    Publish {
        data: Value,
        is_binary: bool,
    },
}

/// Per-channel subscriber lists plus one wildcard list, fed by [`ChannelHub::dispatch`].
#[derive(Debug)]
pub(crate) struct ChannelHub {
    channels: DashMap<String, broadcast::Sender<ChannelEvent>>,
    wildcard: RwLock<broadcast::Sender<(String, ChannelEvent)>>,
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self {
            channels: DashMap::new(),
            wildcard: RwLock::new(broadcast::channel(EVENT_CAPACITY).0),
        }
    }
}

impl ChannelHub {
    pub(crate) fn dispatch(&self, channel: &str, event: ChannelEvent) {
        let delivered = self
            .channels
            .get(channel)
            .map(|tx| tx.send(event.clone()).is_ok());
        if delivered == Some(false) {
            self.channels
                .remove_if(channel, |_, tx| tx.receiver_count() == 0);
        }

        _ = self
            .wildcard
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .send((channel.to_owned(), event));
    }

    pub(crate) fn subscribe(&self, channel: &str) -> broadcast::Receiver<ChannelEvent> {
        self.channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(EVENT_CAPACITY).0)
            .subscribe()
    }

    pub(crate) fn subscribe_all(&self) -> broadcast::Receiver<(String, ChannelEvent)> {
        self.wildcard
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe()
    }

    /// Ends every channel event stream, per-channel and wildcard alike.
    pub(crate) fn clear(&self) {
        self.channels.clear();
        *self.wildcard.write().unwrap_or_else(PoisonError::into_inner) =
            broadcast::channel(EVENT_CAPACITY).0;
    }
}

/// Turns a broadcast receiver into a stream that fails once it lags behind.
pub(crate) fn into_stream<T>(mut rx: broadcast::Receiver<T>) -> impl Stream<Item = Result<T>>
where
    T: Clone + Send + 'static,
{
    try_stream! {
        loop {
            match rx.recv().await {
                Ok(event) => yield event,
                Err(RecvError::Lagged(n)) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Event stream lagged, missed {n} events");
                    Err(WsError::Lagged { count: n })?;
                }
                Err(RecvError::Closed) => {
                    break;
                }
            }
        }
    }
}

/// Resolves with the first event `select` maps to `Some`, failing with a
/// [`TimeoutOrigin::OnceListener`] timeout if `timeout` elapses first.
pub(crate) async fn next_matching<T, U, F>(
    mut rx: broadcast::Receiver<T>,
    mut select: F,
    timeout: Option<Duration>,
) -> Result<U>
where
    T: Clone + Send,
    U: Send,
    F: FnMut(T) -> Option<U> + Send,
{
    let wait = async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(out) = select(event) {
                        return Ok(out);
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Err(WsError::ListenersRemoved.into()),
            }
        }
    };

    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_elapsed| Error::timeout("Once timeout reached.", TimeoutOrigin::OnceListener))?,
        None => wait.await,
    }
}
