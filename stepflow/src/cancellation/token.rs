//! Cancellation token for cooperative cancellation.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::warn;

/// A callback type for cancellation notifications. Receives the reason.
pub type CancelCallback = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Inner {
    /// Whether cancellation has been requested.
    cancelled: AtomicBool,
    /// The reason for cancellation (first one wins).
    reason: RwLock<Option<String>>,
    /// Callbacks to invoke on cancellation.
    callbacks: RwLock<Vec<CancelCallback>>,
    /// Child tokens still alive; dead entries are pruned on registration.
    children: RwLock<Vec<Weak<Inner>>>,
    /// Wakes tasks parked in [`CancellationToken::cancelled`].
    notify: Notify,
}

/// A token for cooperative cancellation.
///
/// Cloning is cheap and every clone observes the same signal. Cancellation is
/// idempotent - only the first cancellation reason is kept.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token that is cancelled whenever `self` is, but can also be
    /// cancelled on its own without affecting `self`.
    #[must_use]
    pub fn child_token(&self) -> Self {
        let child = Self::new();
        {
            let mut children = self.inner.children.write();
            if !self.is_cancelled() {
                children.retain(|weak| weak.strong_count() > 0);
                children.push(Arc::downgrade(&child.inner));
                return child;
            }
        }

        child.cancel(self.reason().unwrap_or_default());
        child
    }

    /// Requests cancellation with a reason.
    ///
    /// This is idempotent - only the first reason is kept.
    /// Callbacks are invoked immediately. Panics in callbacks are logged and suppressed.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            // Held across the flag flip so readers never see a cancelled
            // token without its reason.
            let mut slot = self.inner.reason.write();
            if self
                .inner
                .cancelled
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            *slot = Some(reason.clone());
        }
        self.inner.notify.notify_waiters();

        let children = std::mem::take(&mut *self.inner.children.write());
        for inner in children.iter().filter_map(Weak::upgrade) {
            Self { inner }.cancel(reason.as_str());
        }

        let callbacks = std::mem::take(&mut *self.inner.callbacks.write());
        for callback in callbacks {
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(&reason);
            })) {
                warn!("Cancellation callback panicked: {:?}", e);
            }
        }
    }

    /// Registers a callback to be invoked on cancellation.
    ///
    /// If already cancelled, the callback is invoked immediately.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        {
            let mut callbacks = self.inner.callbacks.write();
            if !self.is_cancelled() {
                callbacks.push(Box::new(callback));
                return;
            }
        }

        let reason = self.reason().unwrap_or_default();
        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            callback(&reason);
        })) {
            warn!("Cancellation callback panicked: {:?}", e);
        }
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.read().clone()
    }

    /// Completes once cancellation has been requested.
    ///
    /// Every suspend point in a step races this future.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_cancelled() {
                return;
            }

            notified.await;
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_token_default_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());
    }

    #[test]
    fn test_token_cancel_idempotent() {
        let token = CancellationToken::new();
        token.cancel("First reason");
        token.cancel("Second reason");

        assert_eq!(token.reason(), Some("First reason".to_string()));
    }

    #[test]
    fn test_clones_share_signal() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel("client disconnected");
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_on_cancel_before_and_after() {
        let token = CancellationToken::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        token.on_cancel(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        token.cancel("test");
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let c = counter.clone();
        token.on_cancel(move |reason| {
            assert_eq!(reason, "test");
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callback_panic_suppressed() {
        let token = CancellationToken::new();
        token.on_cancel(|_| panic!("Intentional panic"));
        token.cancel("test");
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_child_follows_parent_only() {
        let parent = CancellationToken::new();
        let child = parent.child_token();

        child.cancel("timeout");
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let other = parent.child_token();
        parent.cancel("abort");
        assert!(other.is_cancelled());
        assert_eq!(other.reason(), Some("abort".to_string()));
    }

    #[test]
    fn test_dropped_children_are_pruned() {
        let parent = CancellationToken::new();
        for _ in 0..100 {
            let child = parent.child_token();
            drop(child);
        }
        assert!(parent.inner.children.read().len() <= 1);
        assert!(parent.inner.callbacks.read().is_empty());

        let live = parent.child_token();
        parent.cancel("done");
        assert!(live.is_cancelled());
        assert!(parent.child_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel("go");

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel("early");
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("should not block");
    }
}
