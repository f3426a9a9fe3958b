// =============================================================================
// Startup Configuration — read once from the environment
// =============================================================================
//
// Every tunable the process needs at boot lives here.  The environment is
// consulted exactly once, in `Config::from_env()`; nothing re-reads env vars
// at runtime.  A malformed numeric value is a misconfiguration and aborts
// startup — silently falling back to a default would hide the operator error.
// =============================================================================

use anyhow::{Context, Result};
use tracing::info;

/// Default cadence of the per-symbol metric assembler tick.
pub const DEFAULT_ASSEMBLER_TICK_MS: u64 = 250;

/// Process-wide configuration, resolved at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address for the HTTP/WS server.
    pub host: String,
    /// Bind port for the HTTP/WS server.
    pub port: u16,
    /// Allowed CORS origins. Empty means permissive (development).
    pub allowed_origins: Vec<String>,
    /// Hard cap on the leverage accepted by execution settings.
    pub max_leverage: u32,
    /// Capacity of the in-process event log ring.
    pub logger_queue_limit: usize,
    /// Dropped-event count that triggers the halt warning.
    pub logger_drop_halt_threshold: u64,
    /// Symbols the engine tracks.
    pub symbols: Vec<String>,
}

impl Config {
    /// Resolve configuration from the environment.
    ///
    /// Missing variables use defaults; present-but-unparseable numeric
    /// variables are an error (fatal at startup).
    pub fn from_env() -> Result<Self> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port: u16 = parse_env("PORT", 8080)?;
        let max_leverage: u32 = parse_env("MAX_LEVERAGE", 20)?;
        let logger_queue_limit: usize = parse_env("LOGGER_QUEUE_LIMIT", 500)?;
        let logger_drop_halt_threshold: u64 = parse_env("LOGGER_DROP_HALT_THRESHOLD", 1000)?;

        let allowed_origins = csv_env("ALLOWED_ORIGINS");

        let mut symbols: Vec<String> = csv_env("SYMBOLS")
            .into_iter()
            .map(|s| s.to_uppercase())
            .collect();
        if symbols.is_empty() {
            symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        }

        let config = Self {
            host,
            port,
            allowed_origins,
            max_leverage,
            logger_queue_limit,
            logger_drop_halt_threshold,
            symbols,
        };

        info!(
            host = %config.host,
            port = config.port,
            symbols = ?config.symbols,
            max_leverage = config.max_leverage,
            "configuration resolved"
        );

        Ok(config)
    }

    /// Full socket address string for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse an env var as `T`, using `default` when the variable is unset.
fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

/// Split a CSV env var into trimmed, non-empty entries.
fn csv_env(name: &str) -> Vec<String> {
    std::env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
