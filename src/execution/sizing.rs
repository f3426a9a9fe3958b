// =============================================================================
// Sizing Ramp — adaptive margin budget driven by realised P&L
// =============================================================================
//
// The ramp grows the margin budget multiplicatively on winning closes and
// shrinks it on losing ones, always clamped to
//
//   max(0, min_margin) <= budget <= starting_margin * max(1, ramp_max_mult)
//
// so a losing streak can never size below the floor and a hot streak can
// never blow past the configured multiple of starting capital.  Sizing
// queries round the quantity down to the exchange step and refuse orders
// that would land under the venue's minimum notional.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn default_starting_margin() -> f64 {
    100.0
}

fn default_min_margin() -> f64 {
    10.0
}

fn default_ramp_step_pct() -> f64 {
    10.0
}

fn default_ramp_decay_pct() -> f64 {
    20.0
}

fn default_ramp_max_mult() -> f64 {
    3.0
}

/// Ramp tunables, settable via the execution settings endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizingConfig {
    /// Margin budget the session starts from.
    #[serde(default = "default_starting_margin")]
    pub starting_margin: f64,

    /// Floor the budget can never decay below.
    #[serde(default = "default_min_margin")]
    pub min_margin: f64,

    /// Budget growth per winning close, in percent.
    #[serde(default = "default_ramp_step_pct")]
    pub ramp_step_pct: f64,

    /// Budget decay per losing close, in percent.
    #[serde(default = "default_ramp_decay_pct")]
    pub ramp_decay_pct: f64,

    /// Cap on the budget as a multiple of `starting_margin`.
    #[serde(default = "default_ramp_max_mult")]
    pub ramp_max_mult: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            starting_margin: default_starting_margin(),
            min_margin: default_min_margin(),
            ramp_step_pct: default_ramp_step_pct(),
            ramp_decay_pct: default_ramp_decay_pct(),
            ramp_max_mult: default_ramp_max_mult(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sizing query / decision
// ---------------------------------------------------------------------------

/// Inputs needed to size one order.
#[derive(Debug, Clone, Copy)]
pub struct SizingQuery {
    pub mark_price: f64,
    /// Exchange quantity step for the symbol.
    pub step_size: f64,
    /// Exchange minimum order notional for the symbol.
    pub min_notional: f64,
    pub leverage: u32,
}

/// Outcome of a sizing query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SizingDecision {
    /// Step-rounded order quantity (0 when blocked).
    pub quantity: f64,
    /// Notional of the rounded quantity at mark.
    pub notional: f64,
    /// Margin the order would consume.
    pub margin_required: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

impl SizingDecision {
    fn blocked(reason: &str) -> Self {
        Self {
            quantity: 0.0,
            notional: 0.0,
            margin_required: 0.0,
            blocked_reason: Some(reason.to_string()),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked_reason.is_some()
    }
}

// ---------------------------------------------------------------------------
// Ramp
// ---------------------------------------------------------------------------

/// Serialisable view of the ramp for the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SizingRampState {
    pub current_margin_budget: f64,
    pub ramp_mult: f64,
    pub success_count: u64,
    pub fail_count: u64,
}

/// Adaptive margin budget. Written only on closed-trade events, which the
/// execution engine serialises.
#[derive(Debug, Clone)]
pub struct SizingRamp {
    config: SizingConfig,
    budget: f64,
    success_count: u64,
    fail_count: u64,
}

impl SizingRamp {
    pub fn new(config: SizingConfig) -> Self {
        let mut ramp = Self {
            budget: config.starting_margin,
            config,
            success_count: 0,
            fail_count: 0,
        };
        ramp.budget = ramp.clamp(ramp.budget);
        ramp
    }

    /// Lower budget bound.
    fn floor(&self) -> f64 {
        self.config.min_margin.max(0.0)
    }

    /// Upper budget bound.
    fn ceiling(&self) -> f64 {
        let cap = self.config.starting_margin * self.config.ramp_max_mult.max(1.0);
        cap.max(self.floor())
    }

    fn clamp(&self, budget: f64) -> f64 {
        budget.clamp(self.floor(), self.ceiling())
    }

    /// Fold one closed trade's realised P&L into the budget.
    pub fn record_close(&mut self, pnl: f64) {
        if pnl > 0.0 {
            self.success_count += 1;
            self.budget = self.clamp(self.budget * (1.0 + self.config.ramp_step_pct / 100.0));
        } else {
            self.fail_count += 1;
            self.budget = self.clamp(self.budget * (1.0 - self.config.ramp_decay_pct / 100.0));
        }
        debug!(
            pnl,
            budget = self.budget,
            ramp_mult = self.ramp_mult(),
            "sizing ramp updated"
        );
    }

    /// Size an order against the current budget.
    pub fn size_order(&self, query: SizingQuery) -> SizingDecision {
        if query.mark_price <= 0.0 || query.step_size <= 0.0 {
            return SizingDecision::blocked("min_notional");
        }

        let notional = self.budget * query.leverage as f64;
        let quantity = notional / query.mark_price;
        let quantity_rounded = (quantity / query.step_size).floor() * query.step_size;
        let computed_notional = quantity_rounded * query.mark_price;

        if quantity_rounded <= 0.0 || computed_notional < query.min_notional {
            return SizingDecision::blocked("min_notional");
        }

        SizingDecision {
            quantity: quantity_rounded,
            notional: computed_notional,
            margin_required: computed_notional / (query.leverage.max(1)) as f64,
            blocked_reason: None,
        }
    }

    /// Replace the configuration, re-anchoring the budget to the new
    /// starting margin.
    pub fn reconfigure(&mut self, config: SizingConfig) {
        info!(
            starting_margin = config.starting_margin,
            min_margin = config.min_margin,
            ramp_max_mult = config.ramp_max_mult,
            "sizing ramp reconfigured"
        );
        self.config = config;
        self.budget = self.clamp(self.config.starting_margin);
        self.success_count = 0;
        self.fail_count = 0;
    }

    pub fn ramp_mult(&self) -> f64 {
        if self.config.starting_margin <= 0.0 {
            0.0
        } else {
            self.budget / self.config.starting_margin
        }
    }

    pub fn budget(&self) -> f64 {
        self.budget
    }

    pub fn config(&self) -> &SizingConfig {
        &self.config
    }

    pub fn state(&self) -> SizingRampState {
        SizingRampState {
            current_margin_budget: self.budget,
            ramp_mult: self.ramp_mult(),
            success_count: self.success_count,
            fail_count: self.fail_count,
        }
    }
}

impl Default for SizingRamp {
    fn default() -> Self {
        Self::new(SizingConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn config(starting: f64, min: f64, step: f64, decay: f64, max_mult: f64) -> SizingConfig {
        SizingConfig {
            starting_margin: starting,
            min_margin: min,
            ramp_step_pct: step,
            ramp_decay_pct: decay,
            ramp_max_mult: max_mult,
        }
    }

    #[test]
    fn wins_compound_until_the_cap() {
        let mut ramp = SizingRamp::new(config(100.0, 10.0, 50.0, 50.0, 3.0));
        ramp.record_close(5.0);
        assert!((ramp.budget() - 150.0).abs() < 1e-9);
        ramp.record_close(5.0);
        assert!((ramp.budget() - 225.0).abs() < 1e-9);
        ramp.record_close(5.0);
        // 337.5 clamped to 100 * 3.
        assert!((ramp.budget() - 300.0).abs() < 1e-9);

        ramp.record_close(-5.0);
        assert!((ramp.budget() - 150.0).abs() < 1e-9);

        let state = ramp.state();
        assert_eq!(state.success_count, 3);
        assert_eq!(state.fail_count, 1);
        assert!((state.ramp_mult - 1.5).abs() < 1e-9);
    }

    #[test]
    fn losses_never_breach_the_floor() {
        let mut ramp = SizingRamp::new(config(100.0, 10.0, 50.0, 50.0, 2.0));
        for _ in 0..20 {
            ramp.record_close(-1.0);
        }
        assert!((ramp.budget() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn budget_stays_bounded_under_arbitrary_sequences() {
        let cfg = config(100.0, 10.0, 37.0, 23.0, 2.5);
        let mut ramp = SizingRamp::new(cfg.clone());
        let floor = cfg.min_margin.max(0.0);
        let ceiling = cfg.starting_margin * cfg.ramp_max_mult.max(1.0);

        // Deterministic pseudo-random win/loss sequence.
        let mut x: u64 = 0x9e3779b97f4a7c15;
        for _ in 0..500 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            let pnl = if x % 3 == 0 { -1.0 } else { 1.0 };
            ramp.record_close(pnl);
            assert!(ramp.budget() >= floor - 1e-9);
            assert!(ramp.budget() <= ceiling + 1e-9);
        }
    }

    #[test]
    fn breakeven_close_counts_as_fail() {
        let mut ramp = SizingRamp::new(config(100.0, 10.0, 50.0, 50.0, 2.0));
        ramp.record_close(0.0);
        assert_eq!(ramp.state().fail_count, 1);
        assert!((ramp.budget() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn max_mult_below_one_is_lifted_to_one() {
        let mut ramp = SizingRamp::new(config(100.0, 0.0, 50.0, 50.0, 0.5));
        ramp.record_close(1.0);
        // Ceiling is starting * max(1, 0.5) = 100.
        assert!((ramp.budget() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn ramp_mult_zero_when_starting_margin_is_zero() {
        let ramp = SizingRamp::new(config(0.0, 0.0, 50.0, 50.0, 2.0));
        assert_eq!(ramp.ramp_mult(), 0.0);
    }

    #[test]
    fn sizing_rounds_to_step_and_passes_min_notional() {
        let ramp = SizingRamp::new(config(100.0, 10.0, 50.0, 50.0, 2.0));
        let decision = ramp.size_order(SizingQuery {
            mark_price: 30_000.0,
            step_size: 0.001,
            min_notional: 5.0,
            leverage: 10,
        });
        assert!(!decision.is_blocked());
        assert!((decision.quantity - 0.033).abs() < 1e-9);
        assert!((decision.notional - 990.0).abs() < 1e-6);
        assert!((decision.margin_required - 99.0).abs() < 1e-6);
    }

    #[test]
    fn sizing_blocks_under_min_notional() {
        let ramp = SizingRamp::new(config(100.0, 10.0, 50.0, 50.0, 2.0));
        let decision = ramp.size_order(SizingQuery {
            mark_price: 30_000.0,
            step_size: 0.001,
            min_notional: 1_000.0,
            leverage: 10,
        });
        assert!(decision.is_blocked());
        assert_eq!(decision.blocked_reason.as_deref(), Some("min_notional"));
        assert_eq!(decision.quantity, 0.0);
    }

    #[test]
    fn sizing_blocks_when_quantity_rounds_to_zero() {
        let ramp = SizingRamp::new(config(10.0, 0.0, 50.0, 50.0, 2.0));
        let decision = ramp.size_order(SizingQuery {
            mark_price: 1_000_000.0,
            step_size: 1.0,
            min_notional: 5.0,
            leverage: 1,
        });
        assert!(decision.is_blocked());
    }

    #[test]
    fn leverage_floor_in_margin_computation() {
        let ramp = SizingRamp::new(config(100.0, 10.0, 50.0, 50.0, 2.0));
        let decision = ramp.size_order(SizingQuery {
            mark_price: 100.0,
            step_size: 0.1,
            min_notional: 1.0,
            leverage: 0,
        });
        // leverage 0: notional is 0 -> blocked, never a division by zero.
        assert!(decision.is_blocked());
    }
}
