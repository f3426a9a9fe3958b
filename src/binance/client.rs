// =============================================================================
// Binance Futures Testnet Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between this process and the exchange.
// =============================================================================

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

const TESTNET_BASE_URL: &str = "https://testnet.binancefuture.com";

/// Exchange trading filters for one symbol, distilled from exchange-info.
#[derive(Debug, Clone, Copy)]
pub struct SymbolFilters {
    pub step_size: f64,
    pub min_notional: f64,
}

/// Futures testnet REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BinanceTestnetClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceTestnetClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new client.
    ///
    /// # Arguments
    /// * `api_key` — testnet API key (sent as a header, never in query params).
    /// * `secret`  — testnet secret key used exclusively for HMAC signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        // The API key header is required for all signed endpoints.
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = TESTNET_BASE_URL, "BinanceTestnetClient initialised");

        Self {
            api_key,
            secret,
            base_url: TESTNET_BASE_URL.to_string(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Public endpoints
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/ping — connectivity check.
    pub async fn ping(&self) -> Result<()> {
        let url = format!("{}/fapi/v1/ping", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/ping request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("ping returned {}", resp.status());
        }
        Ok(())
    }

    /// GET /fapi/v1/exchangeInfo — symbols and trading filters.
    pub async fn exchange_info(&self) -> Result<serde_json::Value> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/exchangeInfo request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse exchangeInfo response")?;

        if !status.is_success() {
            anyhow::bail!("exchangeInfo returned {}: {}", status, body);
        }
        Ok(body)
    }

    /// Extract the step-size and min-notional filters for `symbol` from an
    /// exchange-info payload.
    pub fn symbol_filters(info: &serde_json::Value, symbol: &str) -> Option<SymbolFilters> {
        let entry = info["symbols"]
            .as_array()?
            .iter()
            .find(|s| s["symbol"].as_str() == Some(symbol))?;

        let mut step_size = None;
        let mut min_notional = None;
        for filter in entry["filters"].as_array()? {
            match filter["filterType"].as_str() {
                Some("LOT_SIZE") => {
                    step_size = filter["stepSize"].as_str().and_then(|s| s.parse().ok());
                }
                Some("MIN_NOTIONAL") => {
                    min_notional = filter["notional"]
                        .as_str()
                        .or_else(|| filter["minNotional"].as_str())
                        .and_then(|s| s.parse().ok());
                }
                _ => {}
            }
        }

        Some(SymbolFilters {
            step_size: step_size?,
            min_notional: min_notional.unwrap_or(0.0),
        })
    }

    // -------------------------------------------------------------------------
    // Signed endpoints
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/leverage (signed) — set leverage for a symbol.
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<serde_json::Value> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        self.signed_post("/fapi/v1/leverage", &params).await
    }

    /// POST /fapi/v1/order (signed) — place a market order.
    pub async fn place_market_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        client_order_id: &str,
    ) -> Result<serde_json::Value> {
        let params = format!(
            "symbol={symbol}&side={side}&type=MARKET&quantity={quantity}&newClientOrderId={client_order_id}"
        );
        self.signed_post("/fapi/v1/order", &params).await
    }

    /// GET /fapi/v2/balance (signed) — account balances.
    pub async fn balances(&self) -> Result<serde_json::Value> {
        let qs = self.signed_query("");
        let url = format!("{}/fapi/v2/balance?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v2/balance request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse balance response")?;

        if !status.is_success() {
            anyhow::bail!("balance returned {}: {}", status, body);
        }
        Ok(body)
    }

    async fn signed_post(&self, path: &str, params: &str) -> Result<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .with_context(|| format!("POST {path} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            warn!(path, status = %status, body = %body, "signed request rejected");
            anyhow::bail!("{path} returned {status}: {body}");
        }
        Ok(body)
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.secret.is_empty()
    }
}

impl std::fmt::Debug for BinanceTestnetClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceTestnetClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_filters_parse_from_exchange_info() {
        let info = serde_json::json!({
            "symbols": [{
                "symbol": "BTCUSDT",
                "filters": [
                    { "filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001" },
                    { "filterType": "MIN_NOTIONAL", "notional": "100" }
                ]
            }]
        });
        let filters = BinanceTestnetClient::symbol_filters(&info, "BTCUSDT").unwrap();
        assert_eq!(filters.step_size, 0.001);
        assert_eq!(filters.min_notional, 100.0);
    }

    #[test]
    fn symbol_filters_missing_symbol() {
        let info = serde_json::json!({ "symbols": [] });
        assert!(BinanceTestnetClient::symbol_filters(&info, "BTCUSDT").is_none());
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let client = BinanceTestnetClient::new("key", "secret");
        let a = client.sign("symbol=BTCUSDT&leverage=5");
        let b = client.sign("symbol=BTCUSDT&leverage=5");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
