// SPDX-License-Identifier: MIT OR Apache-2.0
//! Broadcast-based outcome bus for decoupled event distribution.
//!
//! Step 10 of the pipeline publishes here without awaiting delivery;
//! subscribers (the trust scorer, and any other telemetry consumer) drain
//! at their own pace. Lost events are counted, never propagated back to
//! the receipt return path.

use moat_core::OutcomeEvent;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Default channel capacity for the outcome bus.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct StatsInner {
    total_published: AtomicU64,
    dropped_events: AtomicU64,
}

/// Broadcast bus for [`OutcomeEvent`]s with built-in statistics tracking.
pub struct OutcomeBus {
    tx: broadcast::Sender<OutcomeEvent>,
    stats: Arc<StatsInner>,
}

impl OutcomeBus {
    /// Create a bus with the default channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with the given channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            stats: Arc::new(StatsInner::default()),
        }
    }

    /// Create a new subscription that receives future events.
    #[must_use]
    pub fn subscribe(&self) -> OutcomeSubscription {
        OutcomeSubscription {
            rx: self.tx.subscribe(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Publish an event to all current subscribers. Non-blocking.
    ///
    /// Returns `false` when no subscriber was listening (the event is
    /// dropped and counted).
    pub fn publish(&self, event: OutcomeEvent) -> bool {
        self.stats.total_published.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(event).is_err() {
            self.stats.dropped_events.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Snapshot of the bus statistics.
    #[must_use]
    pub fn stats(&self) -> OutcomeBusStats {
        OutcomeBusStats {
            total_published: self.stats.total_published.load(Ordering::Relaxed),
            active_subscribers: self.tx.receiver_count(),
            dropped_events: self.stats.dropped_events.load(Ordering::Relaxed),
        }
    }
}

impl Default for OutcomeBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle for receiving events from an [`OutcomeBus`].
pub struct OutcomeSubscription {
    rx: broadcast::Receiver<OutcomeEvent>,
    stats: Arc<StatsInner>,
}

impl OutcomeSubscription {
    /// Receive the next event, waiting asynchronously.
    ///
    /// Returns `None` when the bus is closed. Lagged events are counted
    /// in [`OutcomeBusStats::dropped_events`] and skipped.
    pub async fn recv(&mut self) -> Option<OutcomeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.stats.dropped_events.fetch_add(n, Ordering::Relaxed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<OutcomeEvent> {
        match self.rx.try_recv() {
            Ok(ev) => Some(ev),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                self.stats.dropped_events.fetch_add(n, Ordering::Relaxed);
                self.rx.try_recv().ok()
            }
            Err(_) => None,
        }
    }
}

/// Snapshot of outcome bus statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeBusStats {
    /// Total events published to the bus.
    pub total_published: u64,
    /// Subscribers currently listening.
    pub active_subscribers: usize,
    /// Events lost to lag or absent subscribers.
    pub dropped_events: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use moat_core::{CapabilityVersion, ReceiptBuilder, ReceiptStatus};
    use uuid::Uuid;

    fn event() -> OutcomeEvent {
        let receipt = ReceiptBuilder::new(
            "cap.op".parse().unwrap(),
            CapabilityVersion::new(1, 0, 0),
            "t1",
            "r1",
            "k1",
            Uuid::now_v7(),
        )
        .input_hash("h")
        .status(ReceiptStatus::Success)
        .build();
        OutcomeEvent::from_receipt(&receipt)
    }

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = OutcomeBus::new();
        let mut sub = bus.subscribe();
        assert!(bus.publish(event()));
        let got = sub.recv().await.unwrap();
        assert!(got.success);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_counted_not_fatal() {
        let bus = OutcomeBus::new();
        assert!(!bus.publish(event()));
        let stats = bus.stats();
        assert_eq!(stats.total_published, 1);
        assert_eq!(stats.dropped_events, 1);
        assert_eq!(stats.active_subscribers, 0);
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let bus = OutcomeBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(event());
        assert!(a.recv().await.is_some());
        assert!(b.recv().await.is_some());
    }

    #[tokio::test]
    async fn try_recv_is_non_blocking() {
        let bus = OutcomeBus::new();
        let mut sub = bus.subscribe();
        assert!(sub.try_recv().is_none());
        bus.publish(event());
        assert!(sub.try_recv().is_some());
    }
}
