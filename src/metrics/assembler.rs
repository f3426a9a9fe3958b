// =============================================================================
// Metrics Assembler — periodic envelope build and fan-out
// =============================================================================
//
// One tick task per symbol, default 250 ms.  Each tick takes a point-in-time
// read of every collaborator (no mutation), folds the results into a
// `MetricsEnvelope`, and hands it to the hub.  When the book synchroniser is
// recovering from a gap the envelope is tagged STALE and the level arrays are
// elided — metric scalars keep flowing because their state never depended on
// book continuity.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::app_state::SymbolPipeline;
use crate::futures_intel::funding_rate::FundingBlock;
use crate::futures_intel::open_interest::OiBlock;
use crate::hub::SubscriptionHub;
use crate::market_data::cvd::TimeframeCvd;
use crate::market_data::orderbook::BookSide;
use crate::market_data::trade_stream::TimeAndSales;
use crate::metrics::legacy::LegacyMetrics;
use crate::types::{now_ms, FeedState};

/// Book levels published per side.
const BOOK_DEPTH: usize = 8;

/// Full metric envelope pushed to subscribers. Wire form is camelCase JSON;
/// each level is a `[price, size, cumulative]` triple.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsEnvelope {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub symbol: String,
    pub canonical_time_ms: i64,
    pub state: FeedState,
    pub price: f64,
    pub bids: Vec<[f64; 3]>,
    pub asks: Vec<[f64; 3]>,
    pub time_and_sales: TimeAndSales,
    pub cvd: BTreeMap<String, TimeframeCvd>,
    pub open_interest: OiBlock,
    pub funding: Option<FundingBlock>,
    pub absorption: Option<f64>,
    pub legacy_metrics: LegacyMetrics,
}

/// Build one envelope from the pipeline's current state. Read-only.
pub fn build_envelope(pipeline: &SymbolPipeline, now: i64) -> MetricsEnvelope {
    // Book first: the composite block is computed against the same book view
    // the level arrays come from.
    let (state, price, bids, asks, legacy_metrics) = {
        let sync = pipeline.book.read();
        let legacy = pipeline.legacy.read();
        let book = sync.book();

        let state = if sync.is_synced() {
            FeedState::Live
        } else {
            FeedState::Stale
        };

        let mid = book.mid_price();
        let price = if mid > 0.0 { mid } else { legacy.last_price() };

        let (bids, asks) = if state == FeedState::Live {
            (
                book.top_levels(BookSide::Bid, BOOK_DEPTH)
                    .iter()
                    .map(|l| [l.price, l.size, l.cumulative])
                    .collect(),
                book.top_levels(BookSide::Ask, BOOK_DEPTH)
                    .iter()
                    .map(|l| [l.price, l.size, l.cumulative])
                    .collect(),
            )
        } else {
            (Vec::new(), Vec::new())
        };

        (state, price, bids, asks, legacy.compute(book))
    };

    MetricsEnvelope {
        kind: "metrics",
        symbol: pipeline.symbol.clone(),
        canonical_time_ms: now,
        state,
        price,
        bids,
        asks,
        time_and_sales: pipeline.trades.read().summary(),
        cvd: pipeline.cvd.read().snapshot(),
        open_interest: pipeline.open_interest.read().snapshot(),
        funding: {
            let tracker = pipeline.funding.read();
            tracker.snapshot(now)
        },
        absorption: None,
        legacy_metrics,
    }
}

/// Periodic assembly loop for one symbol. Ticks are strictly sequential (a
/// tick finishes before the next is taken), so envelopes for the symbol are
/// monotonic in `canonical_time_ms`.
pub async fn run_assembler(
    pipeline: Arc<SymbolPipeline>,
    hub: Arc<SubscriptionHub>,
    tick: Duration,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    debug!(symbol = %pipeline.symbol, tick_ms = tick.as_millis() as u64, "assembler started");
    loop {
        interval.tick().await;
        let envelope = build_envelope(&pipeline, now_ms());
        hub.publish(envelope);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::app_state::SymbolPipeline;
    use crate::futures_intel::open_interest::OiSource;
    use crate::market_data::orderbook::DepthSnapshot;
    use crate::market_data::trade_stream::Trade;
    use crate::types::Side;

    /// Minimal envelope for hub tests.
    pub fn envelope_for(symbol: &str, canonical_time_ms: i64) -> MetricsEnvelope {
        let pipeline = SymbolPipeline::new(symbol);
        build_envelope(&pipeline, canonical_time_ms)
    }

    fn seeded_pipeline() -> SymbolPipeline {
        let pipeline = SymbolPipeline::new("BTCUSDT");
        pipeline.book.write().apply_snapshot(&DepthSnapshot {
            last_update_id: 10,
            bids: vec![(100.0, 10.0), (99.0, 5.0)],
            asks: vec![(101.0, 7.0), (102.0, 3.0)],
        });
        let trade = Trade {
            price: 100.5,
            quantity: 2.0,
            side: Side::Buy,
            timestamp_ms: 1_000,
            arrival_ms: 1_001,
        };
        pipeline.trades.write().add_trade(trade);
        pipeline.cvd.write().add_trade(&trade);
        pipeline.legacy.write().record_trade(&trade);
        pipeline
    }

    #[test]
    fn live_envelope_carries_book_and_metrics() {
        let pipeline = seeded_pipeline();
        let envelope = build_envelope(&pipeline, 5_000);

        assert_eq!(envelope.kind, "metrics");
        assert_eq!(envelope.symbol, "BTCUSDT");
        assert_eq!(envelope.state, FeedState::Live);
        assert_eq!(envelope.canonical_time_ms, 5_000);
        assert_eq!(envelope.price, 100.5); // mid of 100/101
        assert_eq!(envelope.bids.len(), 2);
        assert_eq!(envelope.bids[0], [100.0, 10.0, 10.0]);
        assert_eq!(envelope.bids[1], [99.0, 5.0, 15.0]);
        assert_eq!(envelope.time_and_sales.trade_count, 1);
        assert!((envelope.legacy_metrics.cvd_session - 2.0).abs() < 1e-12);
        assert_eq!(envelope.open_interest.source, OiSource::Mock);
        assert!(envelope.funding.is_none());
        assert!(envelope.absorption.is_none());
    }

    #[test]
    fn resync_elides_levels_but_keeps_scalars() {
        let pipeline = seeded_pipeline();
        // Force a gap.
        let outcome = pipeline
            .book
            .write()
            .apply_diff(&crate::market_data::orderbook::DepthDiff {
                first_update_id: 100,
                last_update_id: 110,
                bids: vec![],
                asks: vec![],
                event_time_ms: 0,
            });
        assert_eq!(outcome, crate::market_data::orderbook::DiffOutcome::Gap);

        let envelope = build_envelope(&pipeline, 6_000);
        assert_eq!(envelope.state, FeedState::Stale);
        assert!(envelope.bids.is_empty());
        assert!(envelope.asks.is_empty());
        // Trade-derived metrics are untouched by the book gap.
        assert_eq!(envelope.time_and_sales.trade_count, 1);
        assert!((envelope.legacy_metrics.cvd_session - 2.0).abs() < 1e-12);
    }

    #[test]
    fn snapshot_replacement_preserves_aggregators() {
        let pipeline = seeded_pipeline();
        pipeline.book.write().apply_snapshot(&DepthSnapshot {
            last_update_id: 30,
            bids: vec![(200.0, 1.0)],
            asks: vec![(201.0, 1.0)],
        });

        let envelope = build_envelope(&pipeline, 7_000);
        assert_eq!(envelope.state, FeedState::Live);
        assert_eq!(envelope.time_and_sales.aggressive_buy_volume, 2.0);
        assert!((envelope.cvd["tf1m"].cvd - 2.0).abs() < 1e-12);
    }

    #[test]
    fn wire_shape_matches_subscriber_protocol() {
        let pipeline = seeded_pipeline();
        let envelope = build_envelope(&pipeline, 5_000);
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["type"], "metrics");
        assert_eq!(json["state"], "LIVE");
        assert!(json["canonicalTimeMs"].is_i64());
        assert!(json["timeAndSales"]["aggressiveBuyVolume"].is_number());
        assert!(json["cvd"]["tf1m"]["warmUpPct"].is_number());
        assert!(json["openInterest"]["oiChangePct"].is_number());
        assert_eq!(json["openInterest"]["source"], "mock");
        assert!(json["funding"].is_null());
        assert!(json["absorption"].is_null());
        assert!(json["legacyMetrics"]["obiWeighted"].is_number());
        assert!(json["legacyMetrics"]["sweepFadeScore"].is_null());
    }
}
