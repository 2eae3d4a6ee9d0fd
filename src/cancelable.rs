#![expect(
    clippy::module_name_repetitions,
    reason = "CancelablePromise is re-exported and named for use outside this module"
)]

//! Futures that can be canceled while their package is still buffered.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::TryFutureExt as _;
use futures::future::BoxFuture;
use futures::task::AtomicWaker;

use crate::Result;
use crate::error::{Error, TimeoutOrigin};

type Canceller = Box<dyn Fn() -> bool + Send + Sync>;

#[derive(Default)]
struct CancelState {
    settled: bool,
    canceled: bool,
    reason: Option<Error>,
}

struct Shared {
    state: Mutex<CancelState>,
    canceller: Canceller,
    waker: AtomicWaker,
}

impl Shared {
    fn state(&self) -> std::sync::MutexGuard<'_, CancelState> {
        // A poisoned lock only means a canceller panicked; the flags are still coherent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle used to cancel a [`CancelablePromise`], possibly from another task.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state();
        f.debug_struct("CancelHandle")
            .field("settled", &state.settled)
            .field("canceled", &state.canceled)
            .finish_non_exhaustive()
    }
}

impl CancelHandle {
    /// Cancels with a [`Cancellation`](crate::error::Cancellation) error.
    ///
    /// See [`CancelHandle::cancel_with`].
    pub fn cancel(&self) -> bool {
        self.cancel_with(Error::cancellation())
    }

    /// Asks the canceller to withdraw the operation and, if it agrees, rejects the promise
    /// with `reason`.
    ///
    /// Once the promise has settled or was canceled this is a no-op that returns whether it
    /// was canceled.
    pub fn cancel_with(&self, reason: Error) -> bool {
        let mut state = self.shared.state();
        if state.settled || state.canceled {
            return state.canceled;
        }
        if !(self.shared.canceller)() {
            return false;
        }
        state.canceled = true;
        state.reason = Some(reason);
        drop(state);
        self.shared.waker.wake();
        true
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.shared.state().canceled
    }
}

/// A future paired with a canceller.
///
/// The wrapped future is expected to have started its work already; polling only observes
/// the outcome.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct CancelablePromise<T> {
    inner: BoxFuture<'static, Result<T>>,
    handle: CancelHandle,
}

impl<T> fmt::Debug for CancelablePromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelablePromise")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl<T> CancelablePromise<T> {
    pub fn new<F, C>(inner: F, canceller: C) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
        C: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            inner: Box::pin(inner),
            handle: CancelHandle {
                shared: Arc::new(Shared {
                    state: Mutex::new(CancelState::default()),
                    canceller: Box::new(canceller),
                    waker: AtomicWaker::new(),
                }),
            },
        }
    }

    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    /// Shorthand for [`CancelHandle::cancel`].
    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.handle.is_canceled()
    }

    /// Maps the success value, keeping the same cancel handle.
    pub(crate) fn map_ok<U, F>(self, f: F) -> CancelablePromise<U>
    where
        T: 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        CancelablePromise {
            inner: Box::pin(self.inner.map_ok(f)),
            handle: self.handle,
        }
    }
}

impl<T> Future for CancelablePromise<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.handle.shared.waker.register(cx.waker());

        if let Some(reason) = take_cancellation(&this.handle.shared) {
            return Poll::Ready(Err(reason));
        }

        let output = std::task::ready!(this.inner.as_mut().poll(cx));
        let mut state = this.handle.shared.state();
        if state.canceled {
            return Poll::Ready(Err(state.reason.take().unwrap_or_else(Error::cancellation)));
        }
        state.settled = true;
        Poll::Ready(output)
    }
}

fn take_cancellation(shared: &Shared) -> Option<Error> {
    let mut state = shared.state();
    state
        .canceled
        .then(|| state.reason.take().unwrap_or_else(Error::cancellation))
}

/// Races the send outcome `sent` against `timeout`.
///
/// On expiry the promise behind `handle` is canceled with a
/// [`TimeoutOrigin::SendTimeout`] error. Resolves with the send outcome unless that
/// cancellation succeeded; the timer is dropped as soon as `sent` settles.
pub(crate) async fn race_send_timeout(
    handle: CancelHandle,
    mut sent: BoxFuture<'static, Result<()>>,
    timeout: Duration,
    message: &'static str,
) -> Option<Result<()>> {
    tokio::select! {
        result = &mut sent => Some(result),
        () = tokio::time::sleep(timeout) => {
            if handle.cancel_with(Error::timeout(message, TimeoutOrigin::SendTimeout)) {
                #[cfg(feature = "tracing")]
                tracing::debug!(?timeout, "{message}");
                None
            } else {
                Some(sent.await)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use futures::FutureExt as _;
    use tokio::sync::oneshot;

    use super::*;
    use crate::error::Kind;

    #[tokio::test]
    async fn cancel_before_settlement_rejects() {
        let (_tx, rx) = oneshot::channel::<u8>();
        let promise = CancelablePromise::new(async move { Ok(rx.await.unwrap_or(0)) }, || true);

        assert!(promise.cancel());
        assert!(promise.is_canceled());

        let err = promise.await.unwrap_err();
        assert_eq!(err.kind(), Kind::Cancellation);
    }

    #[tokio::test]
    async fn refused_cancel_lets_the_promise_settle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let promise = CancelablePromise::new(async { Ok(7) }, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            false
        });

        assert!(!promise.cancel());
        assert!(!promise.is_canceled());
        assert_eq!(promise.await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_after_settlement_is_a_noop() {
        let invoked = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&invoked);
        let mut promise = CancelablePromise::new(async { Ok(1) }, move || {
            flag.store(true, Ordering::SeqCst);
            true
        });
        let handle = promise.cancel_handle();

        assert_eq!((&mut promise).now_or_never().map(Result::unwrap), Some(1));
        assert!(!handle.cancel());
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn repeated_cancel_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let promise = CancelablePromise::new(futures::future::pending::<Result<()>>(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        assert!(promise.cancel());
        assert!(promise.cancel_handle().cancel_with(Error::validation("second")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(promise.await.unwrap_err().kind(), Kind::Cancellation);
    }

    #[tokio::test(start_paused = true)]
    async fn send_timeout_cancels_pending_send() {
        let promise = CancelablePromise::new(futures::future::pending::<Result<()>>(), || true);
        let handle = promise.cancel_handle();
        let sent = futures::future::pending::<Result<()>>().boxed();

        let outcome = race_send_timeout(
            handle,
            sent,
            Duration::from_millis(50),
            "Transmit send timeout reached.",
        )
        .await;

        assert!(outcome.is_none());
        let err = promise.await.unwrap_err();
        assert_eq!(err.timeout_origin(), Some(TimeoutOrigin::SendTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn settled_send_clears_the_timer() {
        let promise = CancelablePromise::new(async { Ok(()) }, || true);
        let handle = promise.cancel_handle();

        let outcome = race_send_timeout(
            handle.clone(),
            async { Ok(()) }.boxed(),
            Duration::from_millis(50),
            "Transmit send timeout reached.",
        )
        .await;

        assert!(outcome.is_some_and(|r| r.is_ok()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_canceled());
        promise.await.unwrap();
    }
}
