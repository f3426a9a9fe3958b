// =============================================================================
// Open Interest Monitor — polled OI with a rolling 60 s baseline
// =============================================================================
//
// Open Interest (OI) is the total number of outstanding contracts.  The
// monitor polls the futures endpoint every 10 s, keeps 5 minutes of history,
// and pins its change baseline to the oldest sample within the last 60 s, so
// `oi_change_*` always reads "change over roughly the last minute".
//
// Poll failures never clear state: the last known value keeps publishing.  A
// rate-limit response (HTTP 429) is expected under bursty polling and is
// logged at debug only.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::types::now_ms;

/// History retention.
const HISTORY_MS: i64 = 300_000;

/// Baseline horizon.
const BASELINE_MS: i64 = 60_000;

/// Default polling interval.
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// One polled OI observation.
#[derive(Debug, Clone, Copy)]
pub struct OpenInterestSample {
    pub value: f64,
    pub timestamp_ms: i64,
}

/// Where the published OI values come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OiSource {
    /// Live polling against the exchange.
    Real,
    /// No poller attached (tests, detached symbols).
    Mock,
}

/// OI block published in every envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OiBlock {
    pub open_interest: f64,
    pub oi_change_abs: f64,
    pub oi_change_pct: f64,
    pub oi_delta_window: f64,
    pub source: OiSource,
}

/// Per-symbol OI state. Written only by its poll task.
pub struct OpenInterestMonitor {
    symbol: String,
    current: f64,
    previous: f64,
    baseline: f64,
    baseline_ts: i64,
    history: VecDeque<OpenInterestSample>,
    source: OiSource,
}

impl OpenInterestMonitor {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            current: 0.0,
            previous: 0.0,
            baseline: 0.0,
            baseline_ts: 0,
            history: VecDeque::new(),
            source: OiSource::Mock,
        }
    }

    /// Record one successful poll result.
    pub fn record_sample(&mut self, value: f64, now: i64) {
        if self.current == 0.0 {
            // First sample pins the baseline.
            self.baseline = value;
            self.baseline_ts = now;
        } else {
            self.previous = self.current;
        }
        self.current = value;
        self.source = OiSource::Real;

        self.history.push_back(OpenInterestSample {
            value,
            timestamp_ms: now,
        });
        while let Some(front) = self.history.front() {
            if front.timestamp_ms < now - HISTORY_MS {
                self.history.pop_front();
            } else {
                break;
            }
        }

        // Once the baseline is a minute old, re-pin it to the oldest sample
        // still inside the minute.
        if now - self.baseline_ts >= BASELINE_MS {
            if let Some(sample) = self
                .history
                .iter()
                .find(|s| s.timestamp_ms >= now - BASELINE_MS)
            {
                self.baseline = sample.value;
                self.baseline_ts = sample.timestamp_ms;
            }
        }
    }

    /// Current OI block for the envelope.
    pub fn snapshot(&self) -> OiBlock {
        let change_abs = self.current - self.baseline;
        let change_pct = if self.baseline > 0.0 {
            change_abs / self.baseline * 100.0
        } else {
            0.0
        };
        OiBlock {
            open_interest: self.current,
            oi_change_abs: change_abs,
            oi_change_pct: change_pct,
            oi_delta_window: change_abs,
            source: self.source,
        }
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn previous(&self) -> f64 {
        self.previous
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

// ---------------------------------------------------------------------------
// Poll loop
// ---------------------------------------------------------------------------

/// Poll the OI endpoint for `symbol` at a fixed interval, feeding the shared
/// monitor. Never returns under normal operation; failures are absorbed and
/// the last known value persists.
pub async fn run_open_interest_poll(
    symbol: String,
    monitor: Arc<RwLock<OpenInterestMonitor>>,
    client: reqwest::Client,
) {
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    // A failure streak is logged once, not every 10 s.
    let mut failing = false;

    loop {
        interval.tick().await;
        match fetch_open_interest(&client, &symbol).await {
            Ok(value) => {
                monitor.write().record_sample(value, now_ms());
                if failing {
                    debug!(symbol = %symbol, "open interest polling recovered");
                    failing = false;
                }
            }
            Err(PollError::RateLimited) => {
                debug!(symbol = %symbol, "open interest poll rate-limited (429)");
            }
            Err(PollError::Other(e)) => {
                if !failing {
                    warn!(symbol = %symbol, error = %e, "open interest poll failed");
                    failing = true;
                } else {
                    debug!(symbol = %symbol, error = %e, "open interest poll still failing");
                }
            }
        }
    }
}

enum PollError {
    RateLimited,
    Other(anyhow::Error),
}

async fn fetch_open_interest(client: &reqwest::Client, symbol: &str) -> Result<f64, PollError> {
    let url = format!("https://fapi.binance.com/fapi/v1/openInterest?symbol={symbol}");

    let resp = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET open interest for {symbol}"))
        .map_err(PollError::Other)?;

    let status = resp.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(PollError::RateLimited);
    }

    let body: serde_json::Value = resp
        .json()
        .await
        .context("failed to parse open interest response")
        .map_err(PollError::Other)?;

    if !status.is_success() {
        return Err(PollError::Other(anyhow::anyhow!(
            "open interest API returned {status}: {body}"
        )));
    }

    body["openInterest"]
        .as_str()
        .context("missing field openInterest")
        .map_err(PollError::Other)?
        .parse::<f64>()
        .context("failed to parse openInterest value")
        .map_err(PollError::Other)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_pins_the_baseline() {
        let mut m = OpenInterestMonitor::new("BTCUSDT");
        m.record_sample(1000.0, 0);
        let b = m.snapshot();
        assert_eq!(b.open_interest, 1000.0);
        assert_eq!(b.oi_change_abs, 0.0);
        assert_eq!(b.oi_change_pct, 0.0);
        assert_eq!(b.source, OiSource::Real);
    }

    #[test]
    fn change_tracks_against_baseline() {
        let mut m = OpenInterestMonitor::new("BTCUSDT");
        m.record_sample(1000.0, 0);
        m.record_sample(1100.0, 10_000);
        let b = m.snapshot();
        assert_eq!(b.oi_change_abs, 100.0);
        assert!((b.oi_change_pct - 10.0).abs() < 1e-12);
        assert_eq!(b.oi_delta_window, b.oi_change_abs);
        assert_eq!(m.previous(), 1000.0);
    }

    #[test]
    fn baseline_repins_after_a_minute() {
        let mut m = OpenInterestMonitor::new("BTCUSDT");
        m.record_sample(1000.0, 0);
        m.record_sample(1050.0, 30_000);
        // 70 s in: baseline is stale; the oldest sample within the last 60 s
        // is the one at 30 s.
        m.record_sample(1200.0, 70_000);
        let b = m.snapshot();
        assert_eq!(b.oi_change_abs, 1200.0 - 1050.0);
    }

    #[test]
    fn history_is_culled_to_five_minutes() {
        let mut m = OpenInterestMonitor::new("BTCUSDT");
        for i in 0..100 {
            m.record_sample(1000.0 + i as f64, i * 10_000);
        }
        assert!(m.history.front().unwrap().timestamp_ms >= 99 * 10_000 - HISTORY_MS);
    }

    #[test]
    fn unpolled_monitor_reads_mock_zero() {
        let m = OpenInterestMonitor::new("BTCUSDT");
        let b = m.snapshot();
        assert_eq!(b.open_interest, 0.0);
        assert_eq!(b.source, OiSource::Mock);
    }

    #[test]
    fn pct_guard_when_baseline_is_zero() {
        let mut m = OpenInterestMonitor::new("BTCUSDT");
        // Degenerate exchange answer: zero OI.
        m.record_sample(0.0, 0);
        m.record_sample(50.0, 10_000);
        let b = m.snapshot();
        // First non-zero sample re-pins via the current==0 branch.
        assert_eq!(b.open_interest, 50.0);
        assert_eq!(b.oi_change_pct, 0.0);
    }
}
