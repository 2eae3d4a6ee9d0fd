//! Single-settlement result handle that can be completed from outside the future that
//! awaits it.

use std::future::Future;

use tokio::sync::watch;

/// A result slot settled at most once; every clone of [`Deferred::promise`] observes the
/// same outcome.
#[derive(Debug)]
pub(crate) struct Deferred<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone + Send + Sync + 'static> Deferred<T> {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Stores `value` unless already settled. Returns whether this call settled it.
    pub(crate) fn settle(&self, value: T) -> bool {
        let mut value = Some(value);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = value.take();
            true
        })
    }

    /// Resolves with the settled value, or `None` if the deferred is dropped unsettled.
    pub(crate) fn promise(&self) -> impl Future<Output = Option<T>> + Send + use<T> {
        let mut rx = self.tx.subscribe();
        async move {
            let settled = rx.wait_for(Option::is_some).await.ok()?;
            settled.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_settlement_wins() {
        let deferred = Deferred::<Result<u8, String>>::new();
        let promise = deferred.promise();

        assert!(deferred.settle(Ok(1)));
        assert!(!deferred.settle(Err("late".to_owned())));

        assert_eq!(promise.await, Some(Ok(1)));
    }

    #[tokio::test]
    async fn late_promise_sees_settled_value() {
        let deferred = Deferred::<Result<u8, String>>::new();
        deferred.settle(Err("boom".to_owned()));

        assert_eq!(deferred.promise().await, Some(Err("boom".to_owned())));
    }

    #[tokio::test]
    async fn dropped_deferred_yields_none() {
        let deferred = Deferred::<Result<u8, String>>::new();
        let promise = deferred.promise();
        drop(deferred);

        assert_eq!(promise.await, None);
    }
}
