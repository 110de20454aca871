//! Push Fan-Out
//!
//! Registry of follower connections that receive every committed write.
//! A subscriber that cannot keep up is detached; dropping its sender
//! closes the connection and the follower re-syncs through catch-up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::backlog::BacklogEntry;

/// Subscriber registry
#[derive(Default)]
pub struct FanOut {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<BacklogEntry>>>,
    next_id: AtomicU64,
}

impl FanOut {
    /// Create an empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a subscriber. Pushes stop when the returned handle is
    /// detached or dropped.
    pub fn attach(self: &Arc<Self>, sender: mpsc::Sender<BacklogEntry>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, sender);
        tracing::debug!("Subscriber {} attached", id);
        Subscription {
            id,
            fanout: Arc::downgrade(self),
        }
    }

    /// Send an entry to every subscriber
    pub fn publish(&self, entry: &BacklogEntry) {
        let mut subscribers = self.lock();
        subscribers.retain(|id, sender| match sender.try_send(entry.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    "Subscriber {} fell behind at sequence {}, dropping it",
                    id,
                    entry.sequence_number
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Number of attached subscribers
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn detach(&self, id: u64) {
        if self.lock().remove(&id).is_some() {
            tracing::debug!("Subscriber {} detached", id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::Sender<BacklogEntry>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle for one attached subscriber
pub struct Subscription {
    id: u64,
    fanout: Weak<FanOut>,
}

impl Subscription {
    /// Subscriber id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop receiving pushes. Publishing afterwards is a no-op for this subscriber.
    pub fn detach(&self) {
        if let Some(fanout) = self.fanout.upgrade() {
            fanout.detach(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::QueryResult;
    use chrono::Utc;

    fn entry(seq: u64) -> BacklogEntry {
        BacklogEntry {
            sequence_number: seq,
            statement: format!("INSERT INTO t VALUES ({})", seq),
            result: QueryResult::affected(1),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let fanout = FanOut::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let _a = fanout.attach(tx_a);
        let _b = fanout.attach(tx_b);

        fanout.publish(&entry(1));
        fanout.publish(&entry(2));

        assert_eq!(rx_a.recv().await.unwrap().sequence_number, 1);
        assert_eq!(rx_a.recv().await.unwrap().sequence_number, 2);
        assert_eq!(rx_b.recv().await.unwrap().sequence_number, 1);
        assert_eq!(fanout.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_detach_stops_pushes() {
        let fanout = FanOut::new();
        let (tx, mut rx) = mpsc::channel(8);
        let subscription = fanout.attach(tx);

        fanout.publish(&entry(1));
        subscription.detach();
        fanout.publish(&entry(2));

        assert_eq!(rx.recv().await.unwrap().sequence_number, 1);
        // Sender was dropped with the registration
        assert!(rx.recv().await.is_none());
        assert_eq!(fanout.subscriber_count(), 0);

        // Detaching twice, then dropping, is harmless
        subscription.detach();
        drop(subscription);
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_dropped() {
        let fanout = FanOut::new();
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        let _slow = fanout.attach(slow_tx);
        let _fast = fanout.attach(fast_tx);

        fanout.publish(&entry(1));
        fanout.publish(&entry(2));
        fanout.publish(&entry(3));

        assert_eq!(fanout.subscriber_count(), 1);
        assert_eq!(slow_rx.recv().await.unwrap().sequence_number, 1);
        assert!(slow_rx.recv().await.is_none());
        for seq in 1..=3 {
            assert_eq!(fast_rx.recv().await.unwrap().sequence_number, seq);
        }
    }
}
