// =============================================================================
// Funding Monitor — perpetual funding rate with countdown and trend
// =============================================================================
//
// The envelope's funding block carries the latest rate, the countdown to the
// next funding event, and a coarse trend (up / down / flat) against the
// previously observed rate.  The block is null until the first successful
// poll.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

/// Funding data changes slowly; one poll a minute is plenty.
pub const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Rates closer than this are considered unchanged.
const TREND_EPS: f64 = 1e-9;

/// Direction of the funding rate relative to the previous observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FundingTrend {
    Up,
    Down,
    Flat,
}

/// Funding block published in the envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingBlock {
    /// Raw funding rate as a decimal (e.g. 0.0001 = 0.01%).
    pub rate: f64,
    pub time_to_funding_ms: i64,
    pub trend: FundingTrend,
}

/// Per-symbol funding state. Written only by its poll task.
pub struct FundingTracker {
    symbol: String,
    rate: Option<f64>,
    next_funding_time: i64,
    trend: FundingTrend,
}

impl FundingTracker {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            rate: None,
            next_funding_time: 0,
            trend: FundingTrend::Flat,
        }
    }

    /// Record one polled observation.
    pub fn record(&mut self, rate: f64, next_funding_time: i64) {
        self.trend = match self.rate {
            Some(prev) if (rate - prev).abs() <= TREND_EPS => FundingTrend::Flat,
            Some(prev) if rate > prev => FundingTrend::Up,
            Some(_) => FundingTrend::Down,
            None => FundingTrend::Flat,
        };
        self.rate = Some(rate);
        self.next_funding_time = next_funding_time;
    }

    /// Current funding block, or `None` before the first observation.
    pub fn snapshot(&self, now: i64) -> Option<FundingBlock> {
        self.rate.map(|rate| FundingBlock {
            rate,
            time_to_funding_ms: (self.next_funding_time - now).max(0),
            trend: self.trend,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

// ---------------------------------------------------------------------------
// Poll loop
// ---------------------------------------------------------------------------

/// Poll the funding endpoint for `symbol`, feeding the shared tracker.
pub async fn run_funding_poll(
    symbol: String,
    tracker: Arc<RwLock<FundingTracker>>,
    client: reqwest::Client,
) {
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    loop {
        interval.tick().await;
        match fetch_funding(&client, &symbol).await {
            Ok((rate, next_funding_time)) => {
                tracker.write().record(rate, next_funding_time);
                debug!(symbol = %symbol, rate, "funding rate polled");
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "funding rate poll failed");
            }
        }
    }
}

/// Fetch the latest funding rate and the next funding timestamp.
async fn fetch_funding(client: &reqwest::Client, symbol: &str) -> Result<(f64, i64)> {
    let url = format!("https://fapi.binance.com/fapi/v1/premiumIndex?symbol={symbol}");

    let resp = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET funding data for {symbol}"))?;

    let status = resp.status();
    let body: serde_json::Value = resp
        .json()
        .await
        .context("failed to parse funding response body")?;

    if !status.is_success() {
        anyhow::bail!("funding API returned {}: {}", status, body);
    }

    let rate: f64 = body["lastFundingRate"]
        .as_str()
        .unwrap_or("0")
        .parse()
        .unwrap_or(0.0);
    let next_funding_time = body["nextFundingTime"].as_i64().unwrap_or(0);

    Ok((rate, next_funding_time))
}
