//! Session tracking for loopback gateway connections.
//!
//! # Responsibilities
//! - Give every accepted gateway session an id for log correlation
//! - Count live sessions per gateway
//! - Let close wait briefly for sessions to finish

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Relaxed is enough: ids only need to be unique.
static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a gateway session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        Self(SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gw-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Counts {
    active: AtomicU64,
    idle: Notify,
}

/// Counts live sessions; clones share the same count.
#[derive(Debug, Clone, Default)]
pub struct SessionTracker {
    counts: Arc<Counts>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new session. The guard ends it when dropped.
    pub fn track(&self) -> SessionGuard {
        self.counts.active.fetch_add(1, Ordering::SeqCst);
        SessionGuard {
            counts: Arc::clone(&self.counts),
            id: SessionId::next(),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.counts.active.load(Ordering::SeqCst)
    }

    /// Wait until no session is live, up to `limit`. Returns whether it drained.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let drained = async {
            loop {
                let idle = self.counts.idle.notified();
                if self.active_count() == 0 {
                    return;
                }
                idle.await;
            }
        };
        tokio::time::timeout(limit, drained).await.is_ok()
    }
}

/// Lifetime of one gateway session.
#[derive(Debug)]
pub struct SessionGuard {
    counts: Arc<Counts>,
    id: SessionId,
}

impl SessionGuard {
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.counts.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.counts.idle.notify_waiters();
        }
        tracing::trace!(session = %self.id, "Gateway session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_unique() {
        assert_ne!(SessionId::next(), SessionId::next());
    }

    #[test]
    fn tracker_counts_sessions() {
        let tracker = SessionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let first = tracker.track();
        let second = tracker.clone().track();
        assert_eq!(tracker.active_count(), 2);
        assert_ne!(first.id(), second.id());

        drop(first);
        assert_eq!(tracker.active_count(), 1);
        drop(second);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn wait_idle_returns_when_last_session_ends() {
        let tracker = SessionTracker::new();
        let guard = tracker.track();

        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.wait_idle(Duration::from_secs(5)).await }
        });
        tokio::task::yield_now().await;
        drop(guard);
        assert!(waiter.await.unwrap());

        let _held = tracker.track();
        assert!(!tracker.wait_idle(Duration::from_millis(20)).await);
    }
}
