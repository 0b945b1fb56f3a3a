//! Signal-of-Stop: cooperative cancellation primitive.
//!
//! Provides a thread-safe, async-aware cancellation token that can be:
//! - Cloned and shared across tasks
//! - Awaited for cancellation notification
//! - Raced against a future

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A cooperative cancellation token.
///
/// Clones share the same underlying state, so cancelling any clone
/// notifies all waiters.
#[derive(Debug, Clone, Default)]
pub struct SignalOfStop {
    internal: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
}

impl SignalOfStop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to all waiters.
    pub fn cancel(&self) {
        self.internal.closing.store(true, Ordering::Release);
        self.internal.notify.notify_waiters();
    }

    pub fn cancelled(&self) -> bool {
        self.internal.closing.load(Ordering::Acquire)
    }

    /// Wait for cancellation. Returns immediately if already cancelled.
    pub async fn wait(&self) {
        let notified = self.internal.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.cancelled() {
            return;
        }
        notified.await;
    }

    /// Race a future against cancellation.
    ///
    /// Returns `Some(T)` if the future completes first, `None` if
    /// cancellation is signaled first.
    pub async fn select<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            res = fut => Some(res),
            _ = self.wait() => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let sos = SignalOfStop::new();
        let waiter = {
            let sos = sos.clone();
            tokio::spawn(async move { sos.wait().await })
        };
        tokio::task::yield_now().await;
        sos.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(sos.cancelled());
    }

    #[tokio::test]
    async fn select_prefers_finished_future() {
        let sos = SignalOfStop::new();
        assert_eq!(sos.select(async { 7 }).await, Some(7));
        sos.cancel();
        assert_eq!(sos.select(std::future::pending::<u8>()).await, None);
    }
}
