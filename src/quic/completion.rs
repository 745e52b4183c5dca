//! Completion primitives shared between async callers and event handlers

use parking_lot::Mutex;
use std::future::Future;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::{QuicError, Result};

/// Sender half of a single-waiter completion.
pub(crate) type Completer<T> = oneshot::Sender<Result<T>>;

pub(crate) fn completion<T>() -> (Completer<T>, oneshot::Receiver<Result<T>>) {
    oneshot::channel()
}

/// Resolves a captured completer. Call only after releasing the state lock.
pub(crate) fn complete<T>(completer: Option<Completer<T>>, result: Result<T>) {
    if let Some(completer) = completer {
        // The waiter may already have given up.
        let _ = completer.send(result);
    }
}

/// A value that is set exactly once and can be awaited by any number of
/// waiters, before or after it is set.
#[derive(Debug)]
pub(crate) struct OnceSignal<T: Clone> {
    value: Mutex<Option<Result<T>>>,
    notify: Notify,
}

impl<T: Clone> OnceSignal<T> {
    pub(crate) fn new() -> Self {
        Self {
            value: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Returns `false` if the signal had already fired.
    pub(crate) fn complete(&self, result: Result<T>) -> bool {
        {
            let mut value = self.value.lock();
            if value.is_some() {
                return false;
            }
            *value = Some(result);
        }
        self.notify.notify_waiters();
        true
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.value.lock().is_some()
    }

    pub(crate) fn peek(&self) -> Option<Result<T>> {
        self.value.lock().clone()
    }

    pub(crate) async fn wait(&self) -> Result<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(result) = self.peek() {
                return result;
            }
            notified.await;
        }
    }
}

/// Awaits `future` unless `cancel` fires first, in which case `on_cancel`
/// decides the outcome.
pub(crate) async fn with_cancellation<T, F>(
    future: F,
    cancel: &CancellationToken,
    on_cancel: impl FnOnce() -> QuicError,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        result = future => result,
        _ = cancel.cancelled() => Err(on_cancel()),
    }
}

/// Flattens a completion receiver whose sender may have been dropped.
pub(crate) async fn receive<T>(receiver: oneshot::Receiver<Result<T>>) -> Result<T> {
    receiver.await.unwrap_or(Err(QuicError::OperationAborted))
}
