#![expect(
    clippy::module_name_repetitions,
    reason = "CallOptions reads better than Options at call sites"
)]

//! Outcome futures and per-call options for transmit, invoke and publish.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bon::Builder;
use futures::TryFutureExt as _;
use futures::future::BoxFuture;

use crate::Result;
use crate::cancelable::{CancelHandle, CancelablePromise};
use crate::transport::{Batch, PackageOptions};

/// Send timeout of a single call.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SendTimeout {
    /// Use the socket's configured default for the call kind
    #[default]
    Default,
    Never,
    After(Duration),
}

impl SendTimeout {
    pub(crate) fn resolve(self, default: Option<Duration>) -> Option<Duration> {
        match self {
            Self::Default => default,
            Self::Never => None,
            Self::After(timeout) => Some(timeout),
        }
    }
}

/// Options for transmit, invoke and publish calls.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use pubsub_socket::call::{CallOptions, SendTimeout};
/// use pubsub_socket::transport::Batch;
///
/// let options = CallOptions::builder()
///     .send_timeout(SendTimeout::After(Duration::from_secs(1)))
///     .batch(Batch::Window(Duration::from_millis(20)))
///     .cancelable(true)
///     .build();
/// assert!(options.cancelable);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Builder)]
pub struct CallOptions {
    #[builder(default)]
    pub send_timeout: SendTimeout,
    pub batch: Option<Batch>,
    /// Return a future that can withdraw the package while it is still buffered
    #[builder(default)]
    pub cancelable: bool,
    /// Overrides the ack timeout of an invocation
    pub ack_timeout: Option<Duration>,
    /// The data may contain binary parts
    #[builder(default)]
    pub complex_types: bool,
    /// Publish through the acknowledged procedure instead of the fire-and-forget receiver
    #[builder(default)]
    pub ack: bool,
}

impl CallOptions {
    pub(crate) fn package_options(&self) -> PackageOptions {
        PackageOptions {
            ack_timeout: self.ack_timeout,
            complex_types: self.complex_types,
        }
    }
}

/// Outcome of a transmit, invoke or publish.
///
/// The package has already been handed to the transport when a `Call` is returned; awaiting
/// it only observes the result.
#[non_exhaustive]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub enum Call<T> {
    Plain(BoxFuture<'static, Result<T>>),
    Cancelable(CancelablePromise<T>),
}

impl<T> std::fmt::Debug for Call<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain(_) => f.write_str("Call::Plain"),
            Self::Cancelable(promise) => f.debug_tuple("Call::Cancelable").field(promise).finish(),
        }
    }
}

impl<T: 'static> Call<T> {
    /// The cancel handle, if the call was made cancelable or with a send timeout.
    #[must_use]
    pub fn cancel_handle(&self) -> Option<CancelHandle> {
        match self {
            Self::Plain(_) => None,
            Self::Cancelable(promise) => Some(promise.cancel_handle()),
        }
    }

    /// Cancels the call. Returns `false` for plain calls and once the package has left the
    /// send buffer.
    pub fn cancel(&self) -> bool {
        self.cancel_handle().is_some_and(|handle| handle.cancel())
    }

    pub(crate) fn map_ok<U, F>(self, f: F) -> Call<U>
    where
        F: FnOnce(T) -> U + Send + 'static,
    {
        match self {
            Self::Plain(fut) => Call::Plain(Box::pin(fut.map_ok(f))),
            Self::Cancelable(promise) => Call::Cancelable(promise.map_ok(f)),
        }
    }
}

impl<T> Future for Call<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut() {
            Self::Plain(fut) => fut.as_mut().poll(cx),
            Self::Cancelable(promise) => Pin::new(promise).poll(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_timeout_resolution() {
        let default = Some(Duration::from_secs(3));

        assert_eq!(SendTimeout::Default.resolve(default), default);
        assert_eq!(SendTimeout::Default.resolve(None), None);
        assert_eq!(SendTimeout::Never.resolve(default), None);
        assert_eq!(
            SendTimeout::After(Duration::from_secs(1)).resolve(None),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn builder_defaults_match_default() {
        assert_eq!(CallOptions::builder().build(), CallOptions::default());
    }

    #[tokio::test]
    async fn plain_call_is_not_cancelable() {
        let call: Call<u8> = Call::Plain(Box::pin(async { Ok(1) }));

        assert!(call.cancel_handle().is_none());
        assert!(!call.cancel());
        assert_eq!(call.map_ok(|n| n + 1).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn mapped_call_keeps_cancel_handle() {
        let call: Call<u8> = Call::Cancelable(CancelablePromise::new(
            futures::future::pending(),
            || true,
        ));
        let mapped = call.map_ok(|n| n.to_string());

        assert!(mapped.cancel());
        assert!(mapped.await.is_err());
    }
}
