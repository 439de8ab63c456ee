//! Closed signal and background task supervision shared by the watch loop
//! and the keepalive task.

use std::{future::Future, sync::Arc};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};
use tracing::{debug, error};

use crate::models::CloseReason;

#[derive(Debug, Default)]
struct Inner {
    reason: Mutex<Option<CloseReason>>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

/// Cancellation token plus the first recorded close reason.
///
/// The first call to [`Lifecycle::shutdown`] wins; later reasons are ignored.
#[derive(Debug, Clone, Default)]
pub(crate) struct Lifecycle {
    token: CancellationToken,
    inner: Arc<Inner>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Guard cancelling the lifecycle when the owning handle is dropped.
    pub(crate) fn drop_guard(&self) -> DropGuard {
        self.token.clone().drop_guard()
    }

    /// Record `reason` if none is set yet and fire the closed signal.
    /// Returns true for the call that actually closed the lifecycle.
    pub(crate) fn shutdown(&self, reason: CloseReason) -> bool {
        let first = {
            let mut slot = self.inner.reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
                true
            } else {
                false
            }
        };
        self.token.cancel();
        first
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub(crate) fn reason(&self) -> Option<CloseReason> {
        self.inner.reason.lock().clone()
    }

    /// Spawn a supervised task. It is joined by [`Lifecycle::join`].
    pub(crate) fn spawn<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        self.inner.tasks.lock().push((name, handle));
    }

    /// Wait for every supervised task to finish.
    pub(crate) async fn join(&self) {
        let tasks: Vec<_> = std::mem::take(&mut *self.inner.tasks.lock());
        for (name, handle) in tasks {
            match handle.await {
                Ok(()) => debug!(task = name, "background task stopped"),
                Err(err) if err.is_cancelled() => debug!(task = name, "background task aborted"),
                Err(err) => error!(task = name, ?err, "background task panicked"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_reason_wins() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.is_closed());
        assert!(lifecycle.shutdown(CloseReason::LeaseLost(3)));
        assert!(!lifecycle.shutdown(CloseReason::Closed));
        assert!(lifecycle.is_closed());
        assert_eq!(lifecycle.reason(), Some(CloseReason::LeaseLost(3)));
        lifecycle.closed().await;
    }

    #[tokio::test]
    async fn test_join_waits_for_tasks() {
        let lifecycle = Lifecycle::new();
        let token = lifecycle.token();
        let (tx, rx) = tokio::sync::oneshot::channel();
        lifecycle.spawn("waiter", async move {
            token.cancelled().await;
            let _ = tx.send(());
        });
        lifecycle.shutdown(CloseReason::Closed);
        lifecycle.join().await;
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_guard_cancels() {
        let lifecycle = Lifecycle::new();
        drop(lifecycle.drop_guard());
        assert!(lifecycle.is_closed());
        assert_eq!(lifecycle.reason(), None);
    }
}
