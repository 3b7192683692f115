//! Reconnection grace timers.
//!
//! One timer per durable identity. Arming a timer for an identity that
//! already has one cancels the old timer first, so an identity never has
//! two pending evictions. Timers are driven by the owning actor's select
//! loop via [`GraceTracker::next_expired`]; nothing here spawns tasks.

use common::types::{DurableIdentity, RoomCode};
use std::collections::HashMap;
use std::future::poll_fn;
use std::time::Duration;
use tokio_util::time::delay_queue::{DelayQueue, Key};

/// A grace period that ran out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraceExpiry {
    pub identity: DurableIdentity,
    pub room_id: RoomCode,
}

struct PendingEviction {
    key: Key,
    room_id: RoomCode,
}

/// Per-identity grace timers backed by a `DelayQueue`.
pub struct GraceTracker {
    period: Duration,
    queue: DelayQueue<DurableIdentity>,
    pending: HashMap<DurableIdentity, PendingEviction>,
}

impl GraceTracker {
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            queue: DelayQueue::new(),
            pending: HashMap::new(),
        }
    }

    /// Grace period applied to newly armed timers.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Arm a timer for `identity` in `room_id`, replacing any existing one.
    pub fn arm(&mut self, identity: DurableIdentity, room_id: RoomCode) {
        self.cancel(&identity);

        let key = self.queue.insert(identity.clone(), self.period);
        self.pending.insert(identity, PendingEviction { key, room_id });
    }

    /// Cancel the identity's timer. Returns whether one was pending.
    pub fn cancel(&mut self, identity: &DurableIdentity) -> bool {
        match self.pending.remove(identity) {
            Some(pending) => {
                self.queue.try_remove(&pending.key);
                true
            }
            None => false,
        }
    }

    /// Whether the identity has a pending timer for this room.
    #[must_use]
    pub fn is_pending(&self, identity: &DurableIdentity, room_id: &RoomCode) -> bool {
        self.pending
            .get(identity)
            .is_some_and(|p| &p.room_id == room_id)
    }

    /// Number of pending timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Wait for the next timer to fire.
    ///
    /// Never resolves while no timers are pending. Cancel-safe: an expiry
    /// is only removed from the tracker when this future completes.
    pub async fn next_expired(&mut self) -> GraceExpiry {
        loop {
            if self.queue.is_empty() {
                std::future::pending::<()>().await;
            }

            let Some(expired) = poll_fn(|cx| self.queue.poll_expired(cx)).await else {
                continue;
            };

            let identity = expired.into_inner();
            if let Some(pending) = self.pending.remove(&identity) {
                return GraceExpiry {
                    identity,
                    room_id: pending.room_id,
                };
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio::time::{advance, timeout};

    fn identity(s: &str) -> DurableIdentity {
        DurableIdentity::new(s).unwrap()
    }

    fn code(s: &str) -> RoomCode {
        RoomCode::parse(s).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_period() {
        let mut tracker = GraceTracker::new(Duration::from_secs(30));
        tracker.arm(identity("bob"), code("K3M9PQXT"));
        assert!(tracker.is_pending(&identity("bob"), &code("K3M9PQXT")));

        advance(Duration::from_secs(29)).await;
        assert!(
            timeout(Duration::from_millis(1), tracker.next_expired())
                .await
                .is_err(),
            "timer fired early"
        );

        advance(Duration::from_secs(2)).await;
        let expiry = tracker.next_expired().await;
        assert_eq!(expiry.identity, identity("bob"));
        assert_eq!(expiry.room_id, code("K3M9PQXT"));
        assert!(tracker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let mut tracker = GraceTracker::new(Duration::from_secs(30));
        tracker.arm(identity("bob"), code("K3M9PQXT"));

        advance(Duration::from_secs(10)).await;
        assert!(tracker.cancel(&identity("bob")));
        assert!(!tracker.cancel(&identity("bob")));

        advance(Duration::from_secs(60)).await;
        assert!(timeout(Duration::from_millis(1), tracker.next_expired())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous_timer() {
        let mut tracker = GraceTracker::new(Duration::from_secs(30));
        tracker.arm(identity("bob"), code("K3M9PQXT"));

        advance(Duration::from_secs(20)).await;
        tracker.arm(identity("bob"), code("K3M9PQXT"));
        assert_eq!(tracker.len(), 1);

        // The first timer would have fired at 30s
        advance(Duration::from_secs(15)).await;
        assert!(timeout(Duration::from_millis(1), tracker.next_expired())
            .await
            .is_err());

        advance(Duration::from_secs(16)).await;
        let expiry = tracker.next_expired().await;
        assert_eq!(expiry.identity, identity("bob"));

        // Only one eviction for the identity
        assert!(timeout(Duration::from_millis(1), tracker.next_expired())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_identities() {
        let mut tracker = GraceTracker::new(Duration::from_secs(30));
        tracker.arm(identity("alice"), code("K3M9PQXT"));
        advance(Duration::from_secs(5)).await;
        tracker.arm(identity("bob"), code("ABCDEFGH"));

        advance(Duration::from_secs(26)).await;
        let first = tracker.next_expired().await;
        assert_eq!(first.identity, identity("alice"));
        assert!(tracker.is_pending(&identity("bob"), &code("ABCDEFGH")));

        advance(Duration::from_secs(5)).await;
        let second = tracker.next_expired().await;
        assert_eq!(second.identity, identity("bob"));
        assert_eq!(second.room_id, code("ABCDEFGH"));
    }
}
