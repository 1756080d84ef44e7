use std::fmt;
use std::future::{Future, Ready, ready};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};

use super::cache_error::{CacheError, CacheResult};

enum HandleInner<V> {
    /// The value was available right away, from the cache or a stale copy.
    Ready(Ready<CacheResult<V>>),
    /// The value depends on a pending computation.
    Pending(BoxFuture<'static, CacheResult<V>>),
}

/// A handle to a value produced by the cache.
///
/// The handle is a [`Future`] resolving to the value, or to the [`CacheError`] of a failed
/// computation. Callers preferring a best-effort value over error handling use
/// [`await_or_else`](Self::await_or_else).
///
/// Dropping a handle never cancels the underlying computation.
pub struct CacheHandle<V> {
    inner: HandleInner<V>,
}

impl<V> CacheHandle<V>
where
    V: Send + 'static,
{
    /// A handle that is already resolved to `value`.
    pub fn ready(value: V) -> Self {
        Self {
            inner: HandleInner::Ready(ready(Ok(value))),
        }
    }

    /// A handle that is already resolved to `err`.
    pub fn failed(err: CacheError) -> Self {
        Self {
            inner: HandleInner::Ready(ready(Err(err))),
        }
    }

    pub(crate) fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = CacheResult<V>> + Send + 'static,
    {
        Self {
            inner: HandleInner::Pending(future.boxed()),
        }
    }

    /// Whether the value was available without waiting for a computation.
    pub fn is_ready(&self) -> bool {
        matches!(self.inner, HandleInner::Ready(_))
    }

    /// Maps the resolved value with `f`.
    pub fn map<U, F>(self, f: F) -> CacheHandle<U>
    where
        U: Send + 'static,
        F: FnOnce(V) -> U + Send + 'static,
    {
        match self.inner {
            HandleInner::Ready(ready) => CacheHandle {
                inner: HandleInner::Ready(std::future::ready(ready.into_inner().map(f))),
            },
            HandleInner::Pending(future) => {
                CacheHandle::from_future(async move { future.await.map(f) })
            }
        }
    }

    /// Waits for the value for at most `timeout`, or indefinitely if that is `None`.
    ///
    /// Returns `default` if the computation failed or did not finish in time. Giving up does not
    /// cancel the computation, which still populates the cache once done.
    pub async fn await_or_else(self, timeout: Option<Duration>, default: V) -> V {
        let result = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::debug!(?timeout, "gave up waiting for cached value");
                    return default;
                }
            },
            None => self.await,
        };

        match result {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(error = &err as &dyn std::error::Error, "using default value");
                default
            }
        }
    }
}

impl<V> Future for CacheHandle<V> {
    type Output = CacheResult<V>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.inner {
            HandleInner::Ready(ref mut ready) => Pin::new(ready).poll(cx),
            HandleInner::Pending(ref mut future) => future.as_mut().poll(cx),
        }
    }
}

impl<V> fmt::Debug for CacheHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner {
            HandleInner::Ready(_) => "ready",
            HandleInner::Pending(_) => "pending",
        };
        f.debug_tuple("CacheHandle").field(&state).finish()
    }
}

#[cfg(test)]
mod tests {
    use futures::channel::oneshot;

    use super::*;

    #[tokio::test]
    async fn test_ready_handles() {
        let handle = CacheHandle::ready(1);
        assert!(handle.is_ready());
        assert_eq!(handle.await.unwrap(), 1);

        let handle = CacheHandle::<u32>::failed(CacheError::Shutdown);
        assert!(matches!(handle.await, Err(CacheError::Shutdown)));
    }

    #[tokio::test]
    async fn test_await_or_else_failure() {
        let handle = CacheHandle::<&str>::failed(CacheError::computation(anyhow::anyhow!("nope")));
        assert_eq!(handle.await_or_else(None, "default").await, "default");
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_or_else_timeout() {
        let (sender, receiver) = oneshot::channel::<CacheResult<&str>>();
        let handle = CacheHandle::from_future(async move {
            receiver.await.unwrap_or(Err(CacheError::Shutdown))
        });

        let value = handle
            .await_or_else(Some(Duration::from_millis(100)), "default")
            .await;
        assert_eq!(value, "default");
        // the handle was dropped along with its receiver
        assert!(sender.send(Ok("late")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_or_else_in_time() {
        let handle = CacheHandle::from_future(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok("value")
        });
        let value = handle
            .await_or_else(Some(Duration::from_millis(100)), "default")
            .await;
        assert_eq!(value, "value");
    }

    #[tokio::test]
    async fn test_map() {
        let handle = CacheHandle::from_future(async { Ok(21) }).map(|v| v * 2);
        assert!(!handle.is_ready());
        assert_eq!(handle.await.unwrap(), 42);
    }
}
