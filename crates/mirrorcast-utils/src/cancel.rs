//! Cooperative cancellation flag
//!
//! One observable boolean shared by the supervisor, the cascade loops, and
//! the transport. Long-running loops check [`CancelFlag::is_cancelled`]
//! between units of work; async waits race against
//! [`CancelFlag::cancelled`] so in-flight sleeps and HTTP requests abort
//! promptly when the flag trips.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Cloneable cancellation handle. All clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    /// Create a fresh, untripped flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the flag. Idempotent; wakes every pending waiter.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether the flag has been tripped.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the flag is tripped. Returns immediately if it already
    /// is; otherwise suspends until [`CancelFlag::cancel`] is called.
    pub async fn cancelled(&self) {
        // Register interest before the final check to avoid a lost wakeup.
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
