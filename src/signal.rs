//! One-shot broadcast signals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// A one-shot broadcast flag.
///
/// `set` is idempotent and wakes every current and future waiter. Used for
/// `done` (shutdown) and `ready` (bound-to-underlay) signals where many
/// tasks wait on a single state transition.
#[derive(Clone, Default)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

#[derive(Default)]
struct SignalInner {
    set: AtomicBool,
    notify: Notify,
}

impl Signal {
    /// Create a new, unset signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Idempotent.
    pub fn set(&self) {
        if !self.inner.set.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Whether the signal has fired.
    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::SeqCst)
    }

    /// Wait until the signal fires. Returns immediately if already set.
    pub async fn wait(&self) {
        loop {
            if self.is_set() {
                return;
            }
            let notified = self.inner.notify.notified();
            // Re-check after registering so a concurrent set() is not missed
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal").field("set", &self.is_set()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_set_before_wait() {
        let signal = Signal::new();
        signal.set();
        signal.wait().await;
        assert!(signal.is_set());
    }

    #[tokio::test]
    async fn test_wakes_pending_waiters() {
        let signal = Signal::new();
        let waiter = signal.clone();

        let handle = tokio::spawn(async move {
            waiter.wait().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.set();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_set_is_idempotent() {
        let signal = Signal::new();
        signal.set();
        signal.set();
        assert!(signal.is_set());
        signal.wait().await;
    }
}
