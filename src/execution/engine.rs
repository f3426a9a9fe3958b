// =============================================================================
// Execution Engine — single testnet session, ramp-driven sizing
// =============================================================================
//
// Exactly one execution session exists per process.  Connecting validates the
// supplied credentials against the testnet (ping + exchange-info) before any
// state changes; disconnecting drops the client and disables trading.  Order
// quantity always comes from the sizing ramp against the symbol's exchange
// filters, and every closed position feeds its realised P&L back into the
// ramp.
//
// Position tracking is deliberately minimal: one net position per session.
// An order in the opposite direction closes (or flips) it.
// =============================================================================

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::binance::client::{BinanceTestnetClient, SymbolFilters};
use crate::execution::sizing::{SizingConfig, SizingDecision, SizingQuery, SizingRamp, SizingRampState};
use crate::types::Side;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Settings accepted by `POST /api/execution/settings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSettings {
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(flatten)]
    pub sizing: SizingConfig,
}

fn default_leverage() -> u32 {
    5
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            leverage: default_leverage(),
            sizing: SizingConfig::default(),
        }
    }
}

/// Net position held by the session.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPosition {
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
}

/// Snapshot served by `GET /api/execution/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStatus {
    pub connected: bool,
    pub enabled: bool,
    pub symbol: String,
    pub leverage: u32,
    pub max_leverage: u32,
    pub ramp: SizingRampState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<OpenPosition>,
}

/// Outcome of an order attempt.
#[derive(Debug, Clone, Serialize)]
pub enum ExecutionResult {
    /// Order accepted by the testnet.
    Placed(serde_json::Value),
    /// Sizing refused the order.
    Blocked(String),
    /// The session is not in a state to trade.
    Rejected(String),
    /// The exchange refused or the request failed.
    Error(String),
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Placed(v) => write!(f, "Placed({v})"),
            Self::Blocked(reason) => write!(f, "Blocked({reason})"),
            Self::Rejected(reason) => write!(f, "Rejected({reason})"),
            Self::Error(err) => write!(f, "Error({err})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct Session {
    client: Option<BinanceTestnetClient>,
    connected: bool,
    enabled: bool,
    symbol: String,
    leverage: u32,
    filters: Option<SymbolFilters>,
    ramp: SizingRamp,
    position: Option<OpenPosition>,
}

/// The process's single execution session.
///
/// All session state sits behind one async mutex: execution operations are
/// operator-driven and rare, and serialising them keeps the
/// closed-trade-to-ramp path free of interleavings.
pub struct ExecutionEngine {
    max_leverage: u32,
    session: Mutex<Session>,
}

impl ExecutionEngine {
    pub fn new(max_leverage: u32, default_symbol: impl Into<String>) -> Self {
        Self {
            max_leverage,
            session: Mutex::new(Session {
                client: None,
                connected: false,
                enabled: false,
                symbol: default_symbol.into(),
                leverage: default_leverage(),
                filters: None,
                ramp: SizingRamp::default(),
                position: None,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Session lifecycle
    // -------------------------------------------------------------------------

    /// Validate credentials against the testnet and open the session.
    pub async fn connect(&self, api_key: String, api_secret: String) -> anyhow::Result<()> {
        if api_key.is_empty() || api_secret.is_empty() {
            anyhow::bail!("api_key and api_secret are required");
        }

        let client = BinanceTestnetClient::new(api_key, api_secret);
        client.ping().await?;
        let info = client.exchange_info().await?;

        let mut session = self.session.lock().await;
        session.filters = BinanceTestnetClient::symbol_filters(&info, &session.symbol);
        if session.filters.is_none() {
            warn!(symbol = %session.symbol, "no exchange filters for active symbol");
        }
        session.client = Some(client);
        session.connected = true;

        info!(symbol = %session.symbol, "execution session connected");
        Ok(())
    }

    /// Drop the session. Trading is disabled and the open position view is
    /// cleared; the ramp keeps its state for the next session.
    pub async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        session.client = None;
        session.connected = false;
        session.enabled = false;
        session.position = None;
        info!("execution session disconnected");
    }

    /// Enable or disable order placement. Requires a connected session to
    /// enable.
    pub async fn set_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        let mut session = self.session.lock().await;
        if enabled && !session.connected {
            anyhow::bail!("cannot enable execution without a connected session");
        }
        session.enabled = enabled;
        info!(enabled, "execution toggled");
        Ok(())
    }

    /// Apply new settings. Leverage is capped by `MAX_LEVERAGE`; the ramp is
    /// re-anchored to the new sizing config. Pushes the leverage change to
    /// the exchange when connected (best effort).
    pub async fn apply_settings(&self, settings: ExecutionSettings) -> anyhow::Result<()> {
        if settings.leverage == 0 || settings.leverage > self.max_leverage {
            anyhow::bail!(
                "leverage must be between 1 and {} (got {})",
                self.max_leverage,
                settings.leverage
            );
        }
        if settings.sizing.starting_margin <= 0.0 {
            anyhow::bail!("starting_margin must be positive");
        }

        let (client, symbol) = {
            let mut session = self.session.lock().await;
            session.leverage = settings.leverage;
            session.ramp.reconfigure(settings.sizing);
            (session.client.clone(), session.symbol.clone())
        };

        if let Some(client) = client {
            if let Err(e) = client.set_leverage(&symbol, settings.leverage).await {
                warn!(error = %e, "failed to push leverage to exchange");
            }
        }
        Ok(())
    }

    /// Switch the active symbol, refreshing its exchange filters when
    /// connected. Refused while a position is open.
    pub async fn set_symbol(&self, symbol: String) -> anyhow::Result<()> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            anyhow::bail!("symbol is required");
        }

        let client = {
            let mut session = self.session.lock().await;
            if session.position.is_some() {
                anyhow::bail!("cannot switch symbol with an open position");
            }
            session.symbol = symbol.clone();
            session.filters = None;
            session.client.clone()
        };

        if let Some(client) = client {
            let info = client.exchange_info().await?;
            let filters = BinanceTestnetClient::symbol_filters(&info, &symbol);
            if filters.is_none() {
                anyhow::bail!("unknown symbol: {symbol}");
            }
            self.session.lock().await.filters = filters;
        }

        info!(symbol = %symbol, "active execution symbol changed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Place a ramp-sized market order at the given mark price.
    ///
    /// An order in the direction of the open position is rejected (one net
    /// position per session); an opposite order closes the position and
    /// feeds its realised P&L into the ramp.
    pub async fn place_order(&self, side: Side, mark_price: f64) -> ExecutionResult {
        let (client, symbol, quantity, closing) = {
            let session = self.session.lock().await;
            if !session.connected {
                return ExecutionResult::Rejected("session not connected".to_string());
            }
            if !session.enabled {
                return ExecutionResult::Rejected("execution disabled".to_string());
            }
            let Some(filters) = session.filters else {
                return ExecutionResult::Rejected("no exchange filters for symbol".to_string());
            };

            match &session.position {
                Some(pos) if pos.side == side => {
                    return ExecutionResult::Rejected("position already open".to_string());
                }
                Some(pos) => {
                    // Closing order mirrors the open quantity.
                    (
                        session.client.clone().expect("connected session has client"),
                        session.symbol.clone(),
                        pos.quantity,
                        true,
                    )
                }
                None => {
                    let decision: SizingDecision = session.ramp.size_order(SizingQuery {
                        mark_price,
                        step_size: filters.step_size,
                        min_notional: filters.min_notional,
                        leverage: session.leverage,
                    });
                    if let Some(reason) = decision.blocked_reason {
                        return ExecutionResult::Blocked(reason);
                    }
                    (
                        session.client.clone().expect("connected session has client"),
                        session.symbol.clone(),
                        decision.quantity,
                        false,
                    )
                }
            }
        };

        let client_order_id = format!("fd-{}", Uuid::new_v4().simple());
        let wire_side = match side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };

        match client
            .place_market_order(&symbol, wire_side, quantity, &client_order_id)
            .await
        {
            Ok(response) => {
                let mut session = self.session.lock().await;
                if closing {
                    if let Some(pos) = session.position.take() {
                        let pnl =
                            (mark_price - pos.entry_price) * pos.quantity * pos.side.sign();
                        session.ramp.record_close(pnl);
                        info!(
                            symbol = %symbol,
                            pnl,
                            budget = session.ramp.budget(),
                            "position closed — ramp updated"
                        );
                    }
                } else {
                    session.position = Some(OpenPosition {
                        side,
                        quantity,
                        entry_price: mark_price,
                    });
                    info!(symbol = %symbol, side = %side, quantity, "position opened");
                }
                ExecutionResult::Placed(response)
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "order placement failed");
                ExecutionResult::Error(format!("order placement failed: {e}"))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub async fn status(&self) -> ExecutionStatus {
        let session = self.session.lock().await;
        ExecutionStatus {
            connected: session.connected,
            enabled: session.enabled,
            symbol: session.symbol.clone(),
            leverage: session.leverage,
            max_leverage: self.max_leverage,
            ramp: session.ramp.state(),
            position: session.position,
        }
    }

    /// Public exchange-info passthrough for the admin surface. Works without
    /// credentials.
    pub async fn exchange_info(&self) -> anyhow::Result<serde_json::Value> {
        let client = {
            let session = self.session.lock().await;
            session.client.clone()
        };
        match client {
            Some(client) => client.exchange_info().await,
            None => BinanceTestnetClient::new("", "").exchange_info().await,
        }
    }
}
