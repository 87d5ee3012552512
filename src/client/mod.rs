//! Producer and consumer clients
//!
//! Thin async clients over the envelope protocol. The producer adds a
//! reliability layer (versioned latch, exponential-backoff retries); the
//! consumer exposes subscribe/join surfaces and a push stream.

pub mod consumer;
pub mod producer;

pub use consumer::ConsumerClient;
pub use producer::{ProducerClient, SendReceipt};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

/// A one-shot countdown latch bound to an attempt version.
///
/// Each send attempt gets a fresh latch carrying that attempt's version;
/// a confirm for an earlier attempt carries a stale version and cannot
/// resolve the current latch.
pub(crate) struct VersionedLatch {
    version: u64,
    remaining: AtomicUsize,
    notify: Notify,
}

impl VersionedLatch {
    pub(crate) fn new(version: u64, count: usize) -> Self {
        Self {
            version,
            remaining: AtomicUsize::new(count),
            notify: Notify::new(),
        }
    }

    /// Count down one unit if `version` matches. Returns whether the
    /// count moved.
    pub(crate) fn count_down(&self, version: u64) -> bool {
        if version != self.version {
            return false;
        }
        let mut current = self.remaining.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.remaining.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if current == 1 {
                        self.notify.notify_waiters();
                    }
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Wait up to `timeout` for the count to reach zero. The remaining
    /// count is re-checked after registering for notification, so a
    /// count-down racing the registration is never missed.
    pub(crate) async fn wait(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.remaining.load(Ordering::Acquire) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.remaining.load(Ordering::Acquire) == 0;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_resolved(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn resolves_on_matching_version() {
        let latch = Arc::new(VersionedLatch::new(7, 1));
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait(Duration::from_secs(5)).await })
        };
        assert!(latch.count_down(7));
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn stale_version_cannot_resolve() {
        let latch = VersionedLatch::new(7, 1);
        assert!(!latch.count_down(6));
        assert!(!latch.is_resolved());
        assert!(!latch.wait(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn count_down_before_wait_is_not_missed() {
        let latch = VersionedLatch::new(1, 1);
        assert!(latch.count_down(1));
        assert!(latch.wait(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn extra_count_downs_are_ignored() {
        let latch = VersionedLatch::new(1, 1);
        assert!(latch.count_down(1));
        assert!(!latch.count_down(1));
    }
}
