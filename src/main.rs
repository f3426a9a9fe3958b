// =============================================================================
// FlowDeck Orderflow Nexus — Main Entry Point
// =============================================================================
//
// Per tracked symbol the engine runs four writer tasks (depth sync, trade
// ingest, OI poll, funding poll) plus one assembler tick, all sharing the
// symbol's pipeline state.  The execution session starts disconnected; an
// operator attaches testnet credentials through the admin API.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod binance;
mod config;
mod execution;
mod futures_intel;
mod hub;
mod market_data;
mod metrics;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::{Config, DEFAULT_ASSEMBLER_TICK_MS};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("FlowDeck Orderflow Nexus starting up");

    // Misconfiguration is fatal: bail before any task spawns.
    let config = Config::from_env()?;

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config));

    // Shared HTTP client for the public market-data endpoints.
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build reqwest client");

    // ── 3. Spawn per-symbol pipelines ────────────────────────────────────
    for pipeline in state.pipelines.values() {
        // Depth stream (diff WS + snapshot sync).
        {
            let book = pipeline.book.clone();
            let client = http_client.clone();
            let sym = pipeline.symbol.clone();
            tokio::spawn(async move {
                loop {
                    if let Err(e) =
                        market_data::depth_stream::run_depth_stream(&sym, &book, &client).await
                    {
                        error!(symbol = %sym, error = %e, "depth stream error — reconnecting in 5s");
                    }
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            });
        }

        // Trade stream.
        {
            let aggregator = pipeline.trades.clone();
            let cvd = pipeline.cvd.clone();
            let legacy = pipeline.legacy.clone();
            let sym = pipeline.symbol.clone();
            tokio::spawn(async move {
                loop {
                    if let Err(e) = market_data::trade_stream::run_trade_stream(
                        &sym,
                        &aggregator,
                        &cvd,
                        &legacy,
                    )
                    .await
                    {
                        error!(symbol = %sym, error = %e, "trade stream error — reconnecting in 5s");
                    }
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            });
        }

        // Open-interest poll.
        tokio::spawn(futures_intel::open_interest::run_open_interest_poll(
            pipeline.symbol.clone(),
            pipeline.open_interest.clone(),
            http_client.clone(),
        ));

        // Funding poll.
        tokio::spawn(futures_intel::funding_rate::run_funding_poll(
            pipeline.symbol.clone(),
            pipeline.funding.clone(),
            http_client.clone(),
        ));

        // Metric assembler tick.
        tokio::spawn(metrics::assembler::run_assembler(
            pipeline.clone(),
            state.hub.clone(),
            Duration::from_millis(DEFAULT_ASSEMBLER_TICK_MS),
        ));
    }

    info!(count = state.pipelines.len(), "market data pipelines launched");

    // ── 4. Serve the API ─────────────────────────────────────────────────
    let bind_addr = state.config.bind_addr();
    let app = api::rest::router(state.clone());

    // A bind failure is fatal by design.
    let listener = tokio::net::TcpListener::bind(&bind_addr).await.map_err(|e| {
        error!(addr = %bind_addr, error = %e, "failed to bind listener");
        anyhow::anyhow!("failed to bind {bind_addr}: {e}")
    })?;
    info!(addr = %bind_addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            warn!("shutdown signal received — stopping gracefully");
        })
        .await?;

    info!("FlowDeck shut down complete.");
    Ok(())
}
