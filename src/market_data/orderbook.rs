// =============================================================================
// Order Book — gap-free L2 state maintained against a snapshot+diff protocol
// =============================================================================
//
// The depth stream delivers a REST snapshot followed by incremental diffs,
// each tagged with an inclusive update-id range [first_update_id,
// last_update_id].  A diff is applied only when it extends the book's
// sequence exactly:
//
//   first_update_id <= book.last_update_id + 1 <= last_update_id
//
// Anything already covered is dropped; anything that skips ahead is a gap and
// forces a resync.  While resyncing, envelope publication for the symbol is
// tagged STALE and book levels are withheld — downstream trade aggregators
// are NOT reset, their state does not depend on book continuity.
// =============================================================================

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Price key
// ---------------------------------------------------------------------------

/// `f64` price usable as a `BTreeMap` key, ordered by `total_cmp`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Price(pub f64);

impl Eq for Price {}

impl PartialOrd for Price {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Price {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

// ---------------------------------------------------------------------------
// Wire events
// ---------------------------------------------------------------------------

/// Full book snapshot as delivered by the REST depth endpoint.
#[derive(Debug, Clone)]
pub struct DepthSnapshot {
    pub last_update_id: i64,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

/// Incremental depth update from the diff stream.
#[derive(Debug, Clone)]
pub struct DepthDiff {
    /// First update id in this batch (`U`).
    pub first_update_id: i64,
    /// Last update id in this batch (`u`).
    pub last_update_id: i64,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub event_time_ms: i64,
}

/// One resolved price level, with the running total from the top of book.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
    pub cumulative: f64,
}

/// Which side of the book an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Bid,
    Ask,
}

// ---------------------------------------------------------------------------
// OrderBook
// ---------------------------------------------------------------------------

/// L2 book for a single symbol.  Zero-size levels are removed on write.
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    bids: BTreeMap<Price, f64>,
    asks: BTreeMap<Price, f64>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert or remove a single level.
    fn set_level(&mut self, side: BookSide, price: f64, size: f64) {
        let map = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };
        if size == 0.0 {
            map.remove(&Price(price));
        } else {
            map.insert(Price(price), size);
        }
    }

    /// Best (highest) bid price and size.
    pub fn best_bid(&self) -> Option<(f64, f64)> {
        self.bids.iter().next_back().map(|(p, &s)| (p.0, s))
    }

    /// Best (lowest) ask price and size.
    pub fn best_ask(&self) -> Option<(f64, f64)> {
        self.asks.iter().next().map(|(p, &s)| (p.0, s))
    }

    /// Mid price, substituting 0 for a missing side.
    pub fn mid_price(&self) -> f64 {
        let bid = self.best_bid().map(|(p, _)| p).unwrap_or(0.0);
        let ask = self.best_ask().map(|(p, _)| p).unwrap_or(0.0);
        (bid + ask) / 2.0
    }

    /// Sum of sizes over the `depth` best levels on one side.
    pub fn volume_at_depth(&self, side: BookSide, depth: usize) -> f64 {
        match side {
            BookSide::Bid => self.bids.values().rev().take(depth).sum(),
            BookSide::Ask => self.asks.values().take(depth).sum(),
        }
    }

    /// Top `k` levels with cumulative totals, best level first.
    pub fn top_levels(&self, side: BookSide, k: usize) -> Vec<BookLevel> {
        let mut cumulative = 0.0;
        let collect = |(p, &s): (&Price, &f64)| {
            cumulative += s;
            BookLevel {
                price: p.0,
                size: s,
                cumulative,
            }
        };
        match side {
            BookSide::Bid => self.bids.iter().rev().take(k).map(collect).collect(),
            BookSide::Ask => self.asks.iter().take(k).map(collect).collect(),
        }
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }
}

// ---------------------------------------------------------------------------
// BookSynchroniser
// ---------------------------------------------------------------------------

/// Synchronisation state of a symbol's depth pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No snapshot applied yet.
    Init,
    /// Book tracks the diff stream with no gaps.
    Synced,
    /// A gap was detected; waiting for a fresh snapshot.
    Resync,
}

/// Outcome of applying one diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    /// Levels applied, `last_update_id` advanced.
    Applied,
    /// Diff entirely covered by the current book; discarded silently.
    Dropped,
    /// Diff skips ahead of the book; state untouched, resync required.
    Gap,
}

/// Applies snapshots and diffs to an [`OrderBook`], enforcing the sequence
/// rule and surfacing gaps.
#[derive(Debug)]
pub struct BookSynchroniser {
    symbol: String,
    book: OrderBook,
    last_update_id: i64,
    state: SyncState,
}

impl BookSynchroniser {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            book: OrderBook::new(),
            last_update_id: -1,
            state: SyncState::Init,
        }
    }

    /// Replace the book from a snapshot and enter `Synced`.
    pub fn apply_snapshot(&mut self, snapshot: &DepthSnapshot) {
        let mut book = OrderBook::new();
        for &(price, size) in &snapshot.bids {
            book.set_level(BookSide::Bid, price, size);
        }
        for &(price, size) in &snapshot.asks {
            book.set_level(BookSide::Ask, price, size);
        }

        self.book = book;
        self.last_update_id = snapshot.last_update_id;
        self.state = SyncState::Synced;

        info!(
            symbol = %self.symbol,
            last_update_id = snapshot.last_update_id,
            bids = self.book.bid_levels(),
            asks = self.book.ask_levels(),
            "depth snapshot applied"
        );
    }

    /// Apply one diff under the sequence rule.
    ///
    /// | condition                      | outcome   |
    /// |--------------------------------|-----------|
    /// | `u <= last_update_id`          | `Dropped` |
    /// | `U <= last_update_id + 1 <= u` | `Applied` |
    /// | `U > last_update_id + 1`       | `Gap`     |
    pub fn apply_diff(&mut self, diff: &DepthDiff) -> DiffOutcome {
        let next = self.last_update_id + 1;

        if diff.last_update_id <= self.last_update_id {
            debug!(
                symbol = %self.symbol,
                u = diff.last_update_id,
                book = self.last_update_id,
                "stale diff dropped"
            );
            return DiffOutcome::Dropped;
        }

        if diff.first_update_id > next {
            warn!(
                symbol = %self.symbol,
                expected = next,
                got = diff.first_update_id,
                "depth sequence gap — resync required"
            );
            self.state = SyncState::Resync;
            return DiffOutcome::Gap;
        }

        // first_update_id <= next <= last_update_id: apply atomically.
        for &(price, size) in &diff.bids {
            self.book.set_level(BookSide::Bid, price, size);
        }
        for &(price, size) in &diff.asks {
            self.book.set_level(BookSide::Ask, price, size);
        }
        self.last_update_id = diff.last_update_id;
        DiffOutcome::Applied
    }

    /// Force the `Resync` state (e.g. when the stream connection drops).
    pub fn mark_resync(&mut self) {
        if self.state != SyncState::Init {
            self.state = SyncState::Resync;
        }
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.state == SyncState::Synced
    }

    pub fn last_update_id(&self) -> i64 {
        self.last_update_id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: i64) -> DepthSnapshot {
        DepthSnapshot {
            last_update_id: id,
            bids: vec![(100.0, 10.0), (99.0, 5.0)],
            asks: vec![(101.0, 7.0), (102.0, 3.0)],
        }
    }

    fn diff(first: i64, last: i64) -> DepthDiff {
        DepthDiff {
            first_update_id: first,
            last_update_id: last,
            bids: vec![(100.0, 12.0)],
            asks: vec![],
            event_time_ms: 0,
        }
    }

    #[test]
    fn starts_unsynced_with_sentinel_id() {
        let sync = BookSynchroniser::new("BTCUSDT");
        assert_eq!(sync.state(), SyncState::Init);
        assert_eq!(sync.last_update_id(), -1);
    }

    #[test]
    fn diff_before_snapshot_is_a_gap() {
        let mut sync = BookSynchroniser::new("BTCUSDT");
        assert_eq!(sync.apply_diff(&diff(5, 9)), DiffOutcome::Gap);
        assert_eq!(sync.last_update_id(), -1);
    }

    #[test]
    fn sequence_rule_applies_drops_and_gaps() {
        let mut sync = BookSynchroniser::new("BTCUSDT");
        sync.apply_snapshot(&snapshot(10));
        assert_eq!(sync.state(), SyncState::Synced);

        // Overlapping batch that covers id 11: applied.
        assert_eq!(sync.apply_diff(&diff(11, 15)), DiffOutcome::Applied);
        assert_eq!(sync.last_update_id(), 15);

        // Advance to 20, then a batch starting at 22 skips 21: gap.
        assert_eq!(sync.apply_diff(&diff(16, 20)), DiffOutcome::Applied);
        assert_eq!(sync.apply_diff(&diff(22, 25)), DiffOutcome::Gap);
        assert_eq!(sync.state(), SyncState::Resync);
        assert_eq!(sync.last_update_id(), 20);

        // Recover, advance to 30, then an already-covered batch: dropped.
        sync.apply_snapshot(&snapshot(30));
        assert_eq!(sync.apply_diff(&diff(28, 30)), DiffOutcome::Dropped);
        assert_eq!(sync.last_update_id(), 30);
    }

    #[test]
    fn applied_diff_strictly_advances_id() {
        let mut sync = BookSynchroniser::new("ETHUSDT");
        sync.apply_snapshot(&snapshot(100));
        let before = sync.last_update_id();
        assert_eq!(sync.apply_diff(&diff(95, 105)), DiffOutcome::Applied);
        assert!(sync.last_update_id() > before);
        assert_eq!(sync.last_update_id(), 105);
    }

    #[test]
    fn gap_leaves_book_untouched() {
        let mut sync = BookSynchroniser::new("ETHUSDT");
        sync.apply_snapshot(&snapshot(10));
        let best_before = sync.book().best_bid();
        let out = sync.apply_diff(&DepthDiff {
            first_update_id: 50,
            last_update_id: 60,
            bids: vec![(100.0, 999.0)],
            asks: vec![(101.0, 999.0)],
            event_time_ms: 0,
        });
        assert_eq!(out, DiffOutcome::Gap);
        assert_eq!(sync.book().best_bid(), best_before);
        assert_eq!(sync.last_update_id(), 10);
    }

    #[test]
    fn zero_size_removes_level() {
        let mut sync = BookSynchroniser::new("BTCUSDT");
        sync.apply_snapshot(&snapshot(10));
        let out = sync.apply_diff(&DepthDiff {
            first_update_id: 11,
            last_update_id: 11,
            bids: vec![(100.0, 0.0)],
            asks: vec![],
            event_time_ms: 0,
        });
        assert_eq!(out, DiffOutcome::Applied);
        assert_eq!(sync.book().best_bid(), Some((99.0, 5.0)));
    }

    #[test]
    fn snapshot_keeps_book_crossed_free() {
        let mut sync = BookSynchroniser::new("BTCUSDT");
        sync.apply_snapshot(&snapshot(10));
        let (bid, _) = sync.book().best_bid().unwrap();
        let (ask, _) = sync.book().best_ask().unwrap();
        assert!(bid < ask);
    }

    #[test]
    fn top_levels_carry_cumulative_totals() {
        let mut sync = BookSynchroniser::new("BTCUSDT");
        sync.apply_snapshot(&snapshot(10));
        let bids = sync.book().top_levels(BookSide::Bid, 8);
        assert_eq!(bids.len(), 2);
        assert_eq!(bids[0].price, 100.0);
        assert_eq!(bids[0].cumulative, 10.0);
        assert_eq!(bids[1].price, 99.0);
        assert_eq!(bids[1].cumulative, 15.0);

        let asks = sync.book().top_levels(BookSide::Ask, 8);
        assert_eq!(asks[0].price, 101.0);
        assert_eq!(asks[1].cumulative, 10.0);
    }

    #[test]
    fn volume_at_depth_sums_best_levels() {
        let mut sync = BookSynchroniser::new("BTCUSDT");
        sync.apply_snapshot(&snapshot(10));
        assert_eq!(sync.book().volume_at_depth(BookSide::Bid, 1), 10.0);
        assert_eq!(sync.book().volume_at_depth(BookSide::Bid, 10), 15.0);
        assert_eq!(sync.book().volume_at_depth(BookSide::Ask, 10), 10.0);
    }

    #[test]
    fn mid_price_substitutes_zero_for_missing_side() {
        let book = OrderBook::new();
        assert_eq!(book.mid_price(), 0.0);

        let mut sync = BookSynchroniser::new("BTCUSDT");
        sync.apply_snapshot(&DepthSnapshot {
            last_update_id: 1,
            bids: vec![(100.0, 1.0)],
            asks: vec![],
        });
        assert_eq!(sync.book().mid_price(), 50.0);
    }
}
