// =============================================================================
// CVD Calculator — cumulative volume delta over independent timeframes
// =============================================================================
//
// Each configured timeframe owns its own rolling window of signed trade
// quantities (buy = +q, sell = -q).  `cvd` is the signed sum of whatever is
// currently inside the window; with one window per timeframe, `delta` equals
// `cvd`.  `warm_up_pct` tells consumers how much of the window duration is
// actually backed by observed data — values below 100 are preliminary.
// =============================================================================

use std::collections::BTreeMap;

use serde::Serialize;

use crate::market_data::rolling::{RollingWindow, Stamped};
use crate::market_data::trade_stream::Trade;

/// Default timeframes: label -> window duration in ms.
pub const DEFAULT_TIMEFRAMES: [(&str, i64); 3] =
    [("tf1m", 60_000), ("tf5m", 300_000), ("tf15m", 900_000)];

/// A trade reduced to its signed quantity.
#[derive(Debug, Clone, Copy)]
struct SignedTrade {
    signed_quantity: f64,
    timestamp_ms: i64,
}

impl Stamped for SignedTrade {
    fn ts_ms(&self) -> i64 {
        self.timestamp_ms
    }
}

/// Per-timeframe CVD reading.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeframeCvd {
    pub cvd: f64,
    pub delta: f64,
    pub warm_up_pct: f64,
}

struct CvdBucket {
    label: String,
    window: RollingWindow<SignedTrade>,
}

/// Multi-timeframe CVD state for a single symbol.
pub struct CvdCalculator {
    buckets: Vec<CvdBucket>,
}

impl CvdCalculator {
    /// Calculator with the default 1m/5m/15m timeframes.
    pub fn new() -> Self {
        Self::with_timeframes(&DEFAULT_TIMEFRAMES)
    }

    /// Calculator with explicit `(label, duration_ms)` timeframes.
    pub fn with_timeframes(timeframes: &[(&str, i64)]) -> Self {
        Self {
            buckets: timeframes
                .iter()
                .map(|&(label, duration_ms)| CvdBucket {
                    label: label.to_string(),
                    window: RollingWindow::new(duration_ms),
                })
                .collect(),
        }
    }

    /// Record a trade in every timeframe window.
    pub fn add_trade(&mut self, trade: &Trade) {
        let signed = SignedTrade {
            signed_quantity: trade.side.sign() * trade.quantity,
            timestamp_ms: trade.timestamp_ms,
        };
        for bucket in &mut self.buckets {
            bucket.window.push(signed);
        }
    }

    /// Current reading for every timeframe, keyed by label.
    pub fn snapshot(&self) -> BTreeMap<String, TimeframeCvd> {
        self.buckets
            .iter()
            .map(|bucket| (bucket.label.clone(), Self::read_bucket(bucket)))
            .collect()
    }

    fn read_bucket(bucket: &CvdBucket) -> TimeframeCvd {
        let cutoff = bucket.window.cutoff_ms();
        let cvd: f64 = bucket
            .window
            .iter()
            .filter(|t| t.ts_ms() >= cutoff)
            .map(|t| t.signed_quantity)
            .sum();

        let warm_up_pct = match (bucket.window.oldest_ts(), bucket.window.latest_ts()) {
            (Some(oldest), Some(latest)) => {
                let covered = (latest - oldest) as f64;
                (covered / bucket.window.duration_ms() as f64 * 100.0).min(100.0)
            }
            _ => 0.0,
        };

        TimeframeCvd {
            cvd,
            delta: cvd,
            warm_up_pct,
        }
    }
}

impl Default for CvdCalculator {
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
    use crate::types::Side;

    fn trade(side: Side, quantity: f64, ts: i64) -> Trade {
        Trade {
            price: 100.0,
            quantity,
            side,
            timestamp_ms: ts,
            arrival_ms: ts,
        }
    }

    #[test]
    fn cvd_is_signed_sum_of_window() {
        let mut calc = CvdCalculator::new();
        calc.add_trade(&trade(Side::Buy, 3.0, 1_000));
        calc.add_trade(&trade(Side::Sell, 1.0, 2_000));
        calc.add_trade(&trade(Side::Buy, 0.5, 3_000));

        let snap = calc.snapshot();
        for tf in snap.values() {
            assert!((tf.cvd - 2.5).abs() < f64::EPSILON);
            assert_eq!(tf.cvd, tf.delta);
        }
    }

    #[test]
    fn short_timeframe_forgets_what_long_remembers() {
        let mut calc = CvdCalculator::with_timeframes(&[("fast", 1_000), ("slow", 100_000)]);
        calc.add_trade(&trade(Side::Buy, 5.0, 0));
        calc.add_trade(&trade(Side::Sell, 1.0, 10_000));

        let snap = calc.snapshot();
        assert!((snap["fast"].cvd - (-1.0)).abs() < f64::EPSILON);
        assert!((snap["slow"].cvd - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn warm_up_pct_grows_with_coverage() {
        let mut calc = CvdCalculator::with_timeframes(&[("tf", 10_000)]);
        calc.add_trade(&trade(Side::Buy, 1.0, 0));
        assert_eq!(calc.snapshot()["tf"].warm_up_pct, 0.0);

        calc.add_trade(&trade(Side::Buy, 1.0, 5_000));
        assert!((calc.snapshot()["tf"].warm_up_pct - 50.0).abs() < 1e-9);

        calc.add_trade(&trade(Side::Buy, 1.0, 10_000));
        assert_eq!(calc.snapshot()["tf"].warm_up_pct, 100.0);
    }

    #[test]
    fn empty_calculator_reads_zero() {
        let calc = CvdCalculator::new();
        let snap = calc.snapshot();
        assert_eq!(snap.len(), 3);
        for tf in snap.values() {
            assert_eq!(tf.cvd, 0.0);
            assert_eq!(tf.warm_up_pct, 0.0);
        }
    }

    #[test]
    fn default_labels_match_wire_keys() {
        let snap = CvdCalculator::new().snapshot();
        assert!(snap.contains_key("tf1m"));
        assert!(snap.contains_key("tf5m"));
        assert!(snap.contains_key("tf15m"));
    }
}
