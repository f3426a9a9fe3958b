// =============================================================================
// Depth Stream — diff WebSocket + snapshot REST, wired into the synchroniser
// =============================================================================
//
// One task per symbol: connect the diff stream, fetch a REST snapshot, then
// apply diffs in order.  A sequence gap triggers an inline snapshot refetch
// while the socket keeps buffering; a socket error returns to the caller's
// supervision loop for reconnection.  Snapshot fetch failures back off
// exponentially (1 s -> 30 s, x2) and the last known book stays readable the
// whole time — envelopes are simply tagged STALE until resync completes.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use crate::market_data::orderbook::{BookSynchroniser, DepthDiff, DepthSnapshot, DiffOutcome};

const SNAPSHOT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const SNAPSHOT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Depth limit requested from the snapshot endpoint.
const SNAPSHOT_LIMIT: u32 = 1000;

/// Connect the diff-depth WebSocket for `symbol`, synchronise against a REST
/// snapshot, and keep the shared book gap-free.
///
/// Runs until the stream disconnects or errors, then returns so the caller
/// (main.rs) can handle reconnection.
pub async fn run_depth_stream(
    symbol: &str,
    sync: &Arc<RwLock<BookSynchroniser>>,
    client: &reqwest::Client,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("wss://fstream.binance.com/ws/{lower}@depth@100ms");
    info!(url = %url, symbol = %symbol, "connecting to depth WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to depth WebSocket")?;

    info!(symbol = %symbol, "depth WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    // Initial synchronisation point for this connection.
    let snapshot = fetch_snapshot_with_backoff(client, symbol).await;
    sync.write().apply_snapshot(&snapshot);

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    let diff = match parse_depth_diff(&text) {
                        Ok(diff) => diff,
                        Err(e) => {
                            warn!(symbol = %symbol, error = %e, "failed to parse depth diff");
                            continue;
                        }
                    };

                    let outcome = sync.write().apply_diff(&diff);
                    if outcome == DiffOutcome::Gap {
                        // The synchroniser is now in RESYNC; readers see STALE
                        // until the fresh snapshot lands.
                        let snapshot = fetch_snapshot_with_backoff(client, symbol).await;
                        sync.write().apply_snapshot(&snapshot);
                    }
                }
            }
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "depth WebSocket read error");
                sync.write().mark_resync();
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "depth WebSocket stream ended");
                sync.write().mark_resync();
                return Ok(());
            }
        }
    }
}

/// Fetch a depth snapshot, retrying with exponential backoff until it
/// succeeds. The caller keeps serving the last known book meanwhile.
async fn fetch_snapshot_with_backoff(client: &reqwest::Client, symbol: &str) -> DepthSnapshot {
    let mut backoff = SNAPSHOT_BACKOFF_INITIAL;
    loop {
        match fetch_snapshot(client, symbol).await {
            Ok(snapshot) => return snapshot,
            Err(e) => {
                warn!(
                    symbol = %symbol,
                    error = %e,
                    retry_in_s = backoff.as_secs(),
                    "depth snapshot fetch failed"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(SNAPSHOT_BACKOFF_MAX);
            }
        }
    }
}

/// GET the REST depth snapshot for `symbol`.
async fn fetch_snapshot(client: &reqwest::Client, symbol: &str) -> Result<DepthSnapshot> {
    let url = format!(
        "https://fapi.binance.com/fapi/v1/depth?symbol={symbol}&limit={SNAPSHOT_LIMIT}"
    );

    let resp = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET depth snapshot for {symbol}"))?;

    let status = resp.status();
    let body: serde_json::Value = resp
        .json()
        .await
        .context("failed to parse depth snapshot response")?;

    if !status.is_success() {
        anyhow::bail!("depth snapshot API returned {}: {}", status, body);
    }

    let last_update_id = body["lastUpdateId"]
        .as_i64()
        .context("missing field lastUpdateId")?;

    Ok(DepthSnapshot {
        last_update_id,
        bids: parse_levels(&body["bids"]).context("missing field bids")?,
        asks: parse_levels(&body["asks"]).context("missing field asks")?,
    })
}

/// Parse a diff-depth message.
///
/// Expected shape:
/// ```json
/// { "e": "depthUpdate", "E": 1700000000000, "s": "BTCUSDT",
///   "U": 157, "u": 160,
///   "b": [["37000.00", "1.5"]], "a": [["37001.00", "1.2"]] }
/// ```
fn parse_depth_diff(text: &str) -> Result<DepthDiff> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse depth diff JSON")?;

    Ok(DepthDiff {
        first_update_id: root["U"].as_i64().context("missing field U")?,
        last_update_id: root["u"].as_i64().context("missing field u")?,
        bids: parse_levels(&root["b"]).unwrap_or_default(),
        asks: parse_levels(&root["a"]).unwrap_or_default(),
        event_time_ms: root["E"].as_i64().unwrap_or(0),
    })
}

/// Parse a `[["price", "size"], ...]` array of string pairs.
fn parse_levels(value: &serde_json::Value) -> Option<Vec<(f64, f64)>> {
    let arr = value.as_array()?;
    Some(
        arr.iter()
            .filter_map(|pair| {
                let price: f64 = pair.get(0)?.as_str()?.parse().ok()?;
                let size: f64 = pair.get(1)?.as_str()?.parse().ok()?;
                Some((price, size))
            })
            .collect(),
    )
}
