//! Cooperative cancellation
//!
//! An [`AbortSignal`] is threaded into the transport so it can stop
//! in-flight I/O; the matching [`AbortHandle`] fires it.

use error_common::{RequestError, RequestResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected handle/signal pair
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx: Arc::new(tx) }, AbortSignal { rx })
}

impl AbortHandle {
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

impl AbortSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_handle, signal) = abort_pair();
        signal
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once aborted. Pends forever if the handle is dropped unfired.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// A request that can be cancelled while awaited
pub struct CancellableRequest<T> {
    handle: AbortHandle,
    future: BoxFuture<'static, RequestResult<T>>,
}

impl<T> CancellableRequest<T> {
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Handle usable after the request has been moved into a task
    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.clone()
    }
}

impl<T> Future for CancellableRequest<T> {
    type Output = RequestResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.as_mut().poll(cx)
    }
}

/// Run `f` with an abort signal; resolves to [`RequestError::Cancelled`] as
/// soon as `cancel()` is called, dropping the inner future.
pub fn cancellable<T, F, Fut>(f: F) -> CancellableRequest<T>
where
    F: FnOnce(AbortSignal) -> Fut,
    Fut: Future<Output = RequestResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let (handle, signal) = abort_pair();
    let watcher = signal.clone();
    let inner = f(signal);

    let future = async move {
        tokio::select! {
            biased;
            _ = watcher.cancelled() => Err(RequestError::Cancelled),
            result = inner => result,
        }
    }
    .boxed();

    CancellableRequest { handle, future }
}
