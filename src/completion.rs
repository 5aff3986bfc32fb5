//! Write-once completion handles.
//!
//! A [`Completer`] is the writing side and is consumed when it settles, so a
//! completion can never be resolved twice. Dropping an unsettled completer
//! resolves the handle with [`PersistError::Abandoned`], which keeps the
//! "exactly one notification" rule even when a continuation is lost (for
//! example when a session shuts down while an action is still in flight).
//!
//! [`CompletionHandle`] is the reading side. It is a plain `Future`, so
//! callers `.await` it, and it chains with `map` / `and_then` without
//! blocking a thread.

use crate::core::{PersistError, Result};
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Writing side of a completion.
pub struct Completer<T> {
    sender: Option<oneshot::Sender<Result<T>>>,
    label: &'static str,
}

impl<T> Completer<T> {
    pub fn complete(self, value: T) {
        self.settle(Ok(value));
    }

    pub fn fail(self, err: PersistError) {
        self.settle(Err(err));
    }

    pub fn settle(mut self, result: Result<T>) {
        if let Some(sender) = self.sender.take() {
            // The reader may have stopped listening; the result is still final.
            let _ = sender.send(result);
        }
    }

    /// False once the reading side has been dropped.
    pub fn is_observed(&self) -> bool {
        self.sender
            .as_ref()
            .map(|sender| !sender.is_closed())
            .unwrap_or(false)
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Err(PersistError::Abandoned(self.label.to_string())));
        }
    }
}

impl<T> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("label", &self.label)
            .field("settled", &self.sender.is_none())
            .finish()
    }
}

/// Reading side of a completion.
#[must_use = "a completion handle does nothing unless awaited or observed"]
pub struct CompletionHandle<T> {
    inner: BoxFuture<'static, Result<T>>,
}

impl<T: Send + 'static> CompletionHandle<T> {
    /// Creates an unsettled completion. `label` names it in `Abandoned` errors.
    pub fn pending(label: &'static str) -> (Completer<T>, Self) {
        let (sender, receiver) = oneshot::channel();
        let inner = async move {
            match receiver.await {
                Ok(result) => result,
                Err(_) => Err(PersistError::Abandoned(label.to_string())),
            }
        }
        .boxed();
        (
            Completer {
                sender: Some(sender),
                label,
            },
            Self { inner },
        )
    }

    pub fn completed(value: T) -> Self {
        Self {
            inner: future::ready(Ok(value)).boxed(),
        }
    }

    pub fn failed(err: PersistError) -> Self {
        Self {
            inner: future::ready(Err(err)).boxed(),
        }
    }

    pub fn from_result(result: Result<T>) -> Self {
        Self {
            inner: future::ready(result).boxed(),
        }
    }

    pub fn from_future<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self { inner: fut.boxed() }
    }

    pub fn map<U, F>(self, f: F) -> CompletionHandle<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        CompletionHandle {
            inner: self.inner.map(|result| result.map(f)).boxed(),
        }
    }

    pub fn map_err<F>(self, f: F) -> CompletionHandle<T>
    where
        F: FnOnce(PersistError) -> PersistError + Send + 'static,
    {
        CompletionHandle {
            inner: self.inner.map(|result| result.map_err(f)).boxed(),
        }
    }

    /// Chains a dependent completion; the second step starts only after this
    /// one succeeded.
    pub fn and_then<U, F>(self, f: F) -> CompletionHandle<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> CompletionHandle<U> + Send + 'static,
    {
        CompletionHandle {
            inner: async move {
                let value = self.inner.await?;
                f(value).await
            }
            .boxed(),
        }
    }

    /// Runs `f` with the outcome on a runtime task once this handle settles.
    pub fn when_complete<F>(self, f: F)
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        tokio::spawn(async move {
            let result = self.inner.await;
            f(result);
        });
    }

    /// Forwards the outcome into another completer.
    pub fn forward_to(self, completer: Completer<T>) {
        self.when_complete(move |result| completer.settle(result));
    }
}

impl CompletionHandle<()> {
    /// Resolves once every handle resolved; fails with the first failure in
    /// handle order.
    pub fn all(handles: Vec<CompletionHandle<()>>) -> CompletionHandle<()> {
        if handles.is_empty() {
            return CompletionHandle::completed(());
        }
        CompletionHandle {
            inner: async move {
                let results = future::join_all(handles).await;
                results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
            }
            .boxed(),
        }
    }
}

impl<T> Future for CompletionHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().inner.poll_unpin(cx)
    }
}

impl<T> fmt::Debug for CompletionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CompletionHandle")
    }
}
