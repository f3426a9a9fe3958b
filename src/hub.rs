// =============================================================================
// Subscription Hub — envelope fan-out with per-subscriber backpressure
// =============================================================================
//
// The only process-wide shared structure.  Subscribe/unsubscribe touch the
// registry under a single lock; delivery iterates a snapshot of the
// subscriber list so a slow consumer can never block registration.
//
// Each subscription owns a bounded queue.  Overflow drops the OLDEST queued
// envelope (fresh data beats stale data on a telemetry feed) and counts the
// drop; a subscriber that keeps overflowing past the threshold is closed and
// its consumer observes a termination reason.
// =============================================================================

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics::assembler::MetricsEnvelope;

/// Default per-subscription queue bound.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Dropped-envelope count past which a subscription is forcibly closed.
pub const DEFAULT_DROP_CLOSE_THRESHOLD: u64 = 256;

/// Why a subscription stopped delivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The consumer (or the hub on its behalf) unsubscribed.
    Unsubscribed,
    /// The consumer fell too far behind and was cut off.
    Overflow,
}

struct SubQueue {
    queue: VecDeque<Arc<MetricsEnvelope>>,
    closed: Option<CloseReason>,
}

/// One subscriber's registration: symbol filter, bounded queue, drop
/// accounting.
pub struct Subscription {
    id: Uuid,
    symbols: HashSet<String>,
    inner: Mutex<SubQueue>,
    notify: Notify,
    dropped: AtomicU64,
}

impl Subscription {
    fn new(symbols: HashSet<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbols,
            inner: Mutex::new(SubQueue {
                queue: VecDeque::new(),
                closed: None,
            }),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn symbols(&self) -> &HashSet<String> {
        &self.symbols
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Why the subscription closed, if it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.lock().closed
    }

    /// Await the next envelope. Returns `None` once the subscription is
    /// closed and its queue is drained.
    pub async fn recv(&self) -> Option<Arc<MetricsEnvelope>> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(envelope) = inner.queue.pop_front() {
                    return Some(envelope);
                }
                if inner.closed.is_some() {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&self) -> Option<Arc<MetricsEnvelope>> {
        self.inner.lock().queue.pop_front()
    }

    fn close(&self, reason: CloseReason) {
        let mut inner = self.inner.lock();
        if inner.closed.is_none() {
            inner.closed = Some(reason);
        }
        inner.queue.clear();
        drop(inner);
        self.notify.notify_waiters();
    }
}

/// Process-wide registry of envelope subscribers.
pub struct SubscriptionHub {
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
    queue_capacity: usize,
    drop_close_threshold: u64,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_QUEUE_CAPACITY, DEFAULT_DROP_CLOSE_THRESHOLD)
    }

    pub fn with_limits(queue_capacity: usize, drop_close_threshold: u64) -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            queue_capacity,
            drop_close_threshold,
        }
    }

    /// Register a subscriber for `symbols`.
    pub fn subscribe(&self, symbols: HashSet<String>) -> Arc<Subscription> {
        let subscription = Arc::new(Subscription::new(symbols));
        self.subscriptions.lock().push(subscription.clone());
        info!(
            id = %subscription.id,
            symbols = ?subscription.symbols,
            "subscriber registered"
        );
        subscription
    }

    /// Remove a subscriber, draining its queue synchronously.
    pub fn unsubscribe(&self, id: Uuid) {
        let mut subs = self.subscriptions.lock();
        if let Some(pos) = subs.iter().position(|s| s.id == id) {
            let sub = subs.swap_remove(pos);
            drop(subs);
            sub.close(CloseReason::Unsubscribed);
            info!(id = %id, "subscriber removed");
        }
    }

    /// Deliver `envelope` to every subscription matching its symbol.
    pub fn publish(&self, envelope: MetricsEnvelope) {
        let envelope = Arc::new(envelope);
        // Snapshot the registry so delivery never holds the registry lock.
        let snapshot: Vec<Arc<Subscription>> = self.subscriptions.lock().clone();

        let mut overflowed: Vec<Uuid> = Vec::new();
        for sub in snapshot {
            if !sub.symbols.contains(&envelope.symbol) {
                continue;
            }

            let mut inner = sub.inner.lock();
            if inner.closed.is_some() {
                continue;
            }
            inner.queue.push_back(envelope.clone());
            if inner.queue.len() > self.queue_capacity {
                inner.queue.pop_front();
                drop(inner);
                let dropped = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(id = %sub.id, dropped, "subscriber queue full — dropped oldest");
                if dropped > self.drop_close_threshold {
                    warn!(
                        id = %sub.id,
                        dropped,
                        "subscriber persistently slow — closing"
                    );
                    sub.close(CloseReason::Overflow);
                    overflowed.push(sub.id);
                    continue;
                }
            } else {
                drop(inner);
            }
            sub.notify.notify_one();
        }

        // Closed-for-overflow subscriptions leave the registry immediately.
        if !overflowed.is_empty() {
            let mut subs = self.subscriptions.lock();
            subs.retain(|s| !overflowed.contains(&s.id));
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().len()
    }
}

impl Default for SubscriptionHub {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::assembler::tests::envelope_for;

    fn symbols(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn delivery_respects_symbol_filter() {
        let hub = SubscriptionHub::new();
        let btc = hub.subscribe(symbols(&["BTCUSDT"]));
        let eth = hub.subscribe(symbols(&["ETHUSDT"]));

        hub.publish(envelope_for("BTCUSDT", 1));
        assert!(btc.try_recv().is_some());
        assert!(eth.try_recv().is_none());
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let hub = SubscriptionHub::with_limits(2, 1000);
        let sub = hub.subscribe(symbols(&["BTCUSDT"]));

        hub.publish(envelope_for("BTCUSDT", 1));
        hub.publish(envelope_for("BTCUSDT", 2));
        hub.publish(envelope_for("BTCUSDT", 3));

        assert_eq!(sub.dropped_count(), 1);
        // Envelope 1 was sacrificed; 2 and 3 survive in order.
        assert_eq!(sub.try_recv().unwrap().canonical_time_ms, 2);
        assert_eq!(sub.try_recv().unwrap().canonical_time_ms, 3);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn persistent_overflow_closes_subscription() {
        let hub = SubscriptionHub::with_limits(1, 2);
        let sub = hub.subscribe(symbols(&["BTCUSDT"]));

        for i in 0..10 {
            hub.publish(envelope_for("BTCUSDT", i));
        }

        assert_eq!(sub.close_reason(), Some(CloseReason::Overflow));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn unsubscribe_drains_and_removes() {
        let hub = SubscriptionHub::new();
        let sub = hub.subscribe(symbols(&["BTCUSDT"]));
        hub.publish(envelope_for("BTCUSDT", 1));

        hub.unsubscribe(sub.id());
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(sub.close_reason(), Some(CloseReason::Unsubscribed));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn publish_after_close_is_ignored() {
        let hub = SubscriptionHub::new();
        let sub = hub.subscribe(symbols(&["BTCUSDT"]));
        hub.unsubscribe(sub.id());
        hub.publish(envelope_for("BTCUSDT", 1));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn recv_wakes_on_publish_and_ends_on_close() {
        let hub = Arc::new(SubscriptionHub::new());
        let sub = hub.subscribe(symbols(&["BTCUSDT"]));

        let waiter = {
            let sub = sub.clone();
            tokio::spawn(async move { sub.recv().await })
        };
        // Give the waiter a chance to park.
        tokio::task::yield_now().await;

        hub.publish(envelope_for("BTCUSDT", 7));
        let got = waiter.await.unwrap().expect("envelope delivered");
        assert_eq!(got.canonical_time_ms, 7);

        hub.unsubscribe(sub.id());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn per_subscriber_envelopes_are_monotonic() {
        let hub = SubscriptionHub::new();
        let sub = hub.subscribe(symbols(&["BTCUSDT"]));
        for i in 0..20 {
            hub.publish(envelope_for("BTCUSDT", i));
        }
        let mut last = i64::MIN;
        while let Some(envelope) = sub.try_recv() {
            assert!(envelope.canonical_time_ms >= last);
            last = envelope.canonical_time_ms;
        }
    }
}
