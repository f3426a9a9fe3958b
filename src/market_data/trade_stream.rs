// =============================================================================
// Trade Aggregator — rolling window of aggressive trades
// =============================================================================
//
// Every aggressive trade enters a 60 s rolling window.  Size classification
// (small / mid / large) calibrates once from the quantity distribution of the
// first trades and then freezes; burst tracking counts consecutive same-side
// prints.  The aggregator survives stream reconnects and book resyncs — its
// state derives from trades alone.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use crate::market_data::cvd::CvdCalculator;
use crate::market_data::rolling::{RollingWindow, Stamped};
use crate::metrics::legacy::LegacyCalculator;
use crate::types::{now_ms, Side};

/// Default rolling window duration.
pub const DEFAULT_WINDOW_MS: i64 = 60_000;

/// Number of trades used to calibrate the size-class thresholds.
const CALIBRATION_TRADES: usize = 100;

// ---------------------------------------------------------------------------
// Trade
// ---------------------------------------------------------------------------

/// A single aggressive trade. Immutable once recorded.
#[derive(Debug, Clone, Copy)]
pub struct Trade {
    pub price: f64,
    pub quantity: f64,
    pub side: Side,
    /// Exchange event time.
    pub timestamp_ms: i64,
    /// Local receive time, for latency accounting.
    pub arrival_ms: i64,
}

impl Stamped for Trade {
    fn ts_ms(&self) -> i64 {
        self.timestamp_ms
    }
}

/// Size class assigned at ingest time against the calibrated thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Small,
    Mid,
    Large,
}

#[derive(Debug, Clone, Copy)]
struct ClassifiedTrade {
    trade: Trade,
    class: SizeClass,
}

impl Stamped for ClassifiedTrade {
    fn ts_ms(&self) -> i64 {
        self.trade.timestamp_ms
    }
}

/// Frozen quantity thresholds separating the size classes.
#[derive(Debug, Clone, Copy)]
struct SizeThresholds {
    small_max: f64,
    large_min: f64,
}

impl SizeThresholds {
    fn classify(&self, quantity: f64) -> SizeClass {
        if quantity <= self.small_max {
            SizeClass::Small
        } else if quantity >= self.large_min {
            SizeClass::Large
        } else {
            SizeClass::Mid
        }
    }
}

/// Nearest-rank percentile of an unsorted sample.
fn percentile(values: &[f64], pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

// ---------------------------------------------------------------------------
// Window summary (the envelope's timeAndSales block)
// ---------------------------------------------------------------------------

/// Current run of consecutive same-side prints.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConsecutiveBurst {
    pub side: Side,
    pub count: u32,
}

/// Point-in-time summary of the trade window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeAndSales {
    pub aggressive_buy_volume: f64,
    pub aggressive_sell_volume: f64,
    pub trade_count: u64,
    pub prints_per_second: f64,
    pub small_trades: u64,
    pub mid_trades: u64,
    pub large_trades: u64,
    pub bid_hit_ask_lift_ratio: f64,
    pub consecutive_burst: Option<ConsecutiveBurst>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_latency_ms: Option<f64>,
}

// ---------------------------------------------------------------------------
// TradeAggregator
// ---------------------------------------------------------------------------

/// Rolling-window aggregator for a single symbol's aggressive trades.
pub struct TradeAggregator {
    symbol: String,
    window: RollingWindow<ClassifiedTrade>,
    /// Quantities observed before the thresholds froze.
    calibration: Vec<f64>,
    thresholds: Option<SizeThresholds>,
    burst: Option<ConsecutiveBurst>,
}

impl TradeAggregator {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self::with_window(symbol, DEFAULT_WINDOW_MS)
    }

    pub fn with_window(symbol: impl Into<String>, window_ms: i64) -> Self {
        Self {
            symbol: symbol.into(),
            window: RollingWindow::new(window_ms),
            calibration: Vec::with_capacity(CALIBRATION_TRADES),
            thresholds: None,
            burst: None,
        }
    }

    /// Record one trade: calibrate/classify, update the burst run, append to
    /// the window (which evicts aged entries).
    pub fn add_trade(&mut self, trade: Trade) {
        if self.thresholds.is_none() {
            self.calibration.push(trade.quantity);
            if self.calibration.len() >= CALIBRATION_TRADES {
                let thresholds = SizeThresholds {
                    small_max: percentile(&self.calibration, 25.0),
                    large_min: percentile(&self.calibration, 75.0),
                };
                info!(
                    symbol = %self.symbol,
                    small_max = thresholds.small_max,
                    large_min = thresholds.large_min,
                    "trade size thresholds calibrated"
                );
                self.thresholds = Some(thresholds);
                self.calibration = Vec::new();
            }
        }

        // Provisional thresholds from the partial calibration sample until
        // the real ones freeze.
        let class = match self.thresholds {
            Some(t) => t.classify(trade.quantity),
            None => SizeThresholds {
                small_max: percentile(&self.calibration, 25.0),
                large_min: percentile(&self.calibration, 75.0),
            }
            .classify(trade.quantity),
        };

        self.burst = Some(match self.burst {
            Some(b) if b.side == trade.side => ConsecutiveBurst {
                side: b.side,
                count: b.count + 1,
            },
            _ => ConsecutiveBurst {
                side: trade.side,
                count: 1,
            },
        });

        self.window.push(ClassifiedTrade { trade, class });
    }

    /// Summarise the live portion of the window.
    ///
    /// Reads are non-mutating: expiry is enforced by filtering against the
    /// window cutoff, so late entries never pollute the sums.
    pub fn summary(&self) -> TimeAndSales {
        let cutoff = self.window.cutoff_ms();

        let mut buy_volume = 0.0;
        let mut sell_volume = 0.0;
        let mut buy_count: u64 = 0;
        let mut sell_count: u64 = 0;
        let mut small: u64 = 0;
        let mut mid: u64 = 0;
        let mut large: u64 = 0;
        let mut latency_sum = 0.0;
        let mut count: u64 = 0;

        for entry in self.window.iter().filter(|e| e.ts_ms() >= cutoff) {
            let t = &entry.trade;
            count += 1;
            match t.side {
                Side::Buy => {
                    buy_volume += t.quantity;
                    buy_count += 1;
                }
                Side::Sell => {
                    sell_volume += t.quantity;
                    sell_count += 1;
                }
            }
            match entry.class {
                SizeClass::Small => small += 1,
                SizeClass::Mid => mid += 1,
                SizeClass::Large => large += 1,
            }
            latency_sum += (t.arrival_ms - t.timestamp_ms) as f64;
        }

        let window_secs = self.window.duration_ms() as f64 / 1000.0;

        TimeAndSales {
            aggressive_buy_volume: buy_volume,
            aggressive_sell_volume: sell_volume,
            trade_count: count,
            prints_per_second: if window_secs > 0.0 {
                count as f64 / window_secs
            } else {
                0.0
            },
            small_trades: small,
            mid_trades: mid,
            large_trades: large,
            bid_hit_ask_lift_ratio: buy_count as f64 / (sell_count.max(1)) as f64,
            consecutive_burst: self.burst,
            avg_latency_ms: if count > 0 {
                Some(latency_sum / count as f64)
            } else {
                None
            },
        }
    }

    /// Discard all state, including the frozen thresholds.
    pub fn reset(&mut self) {
        self.window.clear();
        self.calibration.clear();
        self.thresholds = None;
        self.burst = None;
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

// ---------------------------------------------------------------------------
// Trade WebSocket stream
// ---------------------------------------------------------------------------

/// Connect to the futures aggTrade stream for one symbol and fan each trade
/// into the aggregator, the CVD calculator, and the composite calculator.
///
/// Runs until the stream disconnects or errors, then returns so the caller
/// (main.rs) can handle reconnection. All three consumers keep their state
/// across reconnects.
pub async fn run_trade_stream(
    symbol: &str,
    aggregator: &Arc<RwLock<TradeAggregator>>,
    cvd: &Arc<RwLock<CvdCalculator>>,
    legacy: &Arc<RwLock<LegacyCalculator>>,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("wss://fstream.binance.com/ws/{lower}@aggTrade");
    info!(url = %url, symbol = %symbol, "connecting to trade WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to trade WebSocket")?;

    info!(symbol = %symbol, "trade WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_agg_trade(&text) {
                        Ok(trade) => {
                            aggregator.write().add_trade(trade);
                            cvd.write().add_trade(&trade);
                            legacy.write().record_trade(&trade);
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to parse aggTrade message");
                        }
                    }
                }
            }
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "trade WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "trade WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a futures aggTrade message.
///
/// Expected shape:
/// ```json
/// { "e": "aggTrade", "s": "BTCUSDT", "p": "37000.00", "q": "0.123",
///   "T": 1700000000000, "m": true }
/// ```
///
/// `m == true` means the buyer was the maker, i.e. the aggressor sold.
fn parse_agg_trade(text: &str) -> Result<Trade> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse aggTrade JSON")?;

    let price: f64 = root["p"]
        .as_str()
        .context("missing field p")?
        .parse()
        .context("failed to parse price")?;

    let quantity: f64 = root["q"]
        .as_str()
        .context("missing field q")?
        .parse()
        .context("failed to parse quantity")?;

    let is_buyer_maker = root["m"].as_bool().context("missing field m")?;
    let timestamp_ms = root["T"].as_i64().context("missing field T")?;

    Ok(Trade {
        price,
        quantity,
        side: if is_buyer_maker { Side::Sell } else { Side::Buy },
        timestamp_ms,
        arrival_ms: now_ms(),
    })
}
