//! Risk & Position Sizing
//!
//! The one place stops, targets and sizes are derived. Everything else asks
//! this module.

use std::sync::Arc;

use super::account::AccountState;
use crate::config::EngineConfig;
use crate::error::{RejectReason, ValidationError};
use crate::trading_core::signals::Signal;
use crate::types::Side;

/// Float slack for step flooring and cap comparisons
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitLevels {
    pub stop_loss: f64,
    pub take_profit: f64,
    pub stop_distance: f64,
    pub reward_ratio: f64,
}

/// A size computed against one account version
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizedOrder {
    pub size: f64,
    pub risk_amount: f64,
    pub stop_distance: f64,
    pub account_version: u64,
}

/// Floor `value` to a multiple of `step`
pub fn floor_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 || !value.is_finite() || value <= 0.0 {
        return 0.0;
    }
    let steps = (value / step + EPSILON).floor();
    round_to(steps * step, 9)
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[derive(Debug, Clone)]
pub struct RiskEngine {
    config: Arc<EngineConfig>,
}

impl RiskEngine {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stop beyond the invalidation point plus buffer, floored to the minimum
    /// distance; target from the confidence tier's reward ratio.
    pub fn exit_levels(
        &self,
        side: Side,
        entry: f64,
        invalidation: f64,
        confidence: f64,
    ) -> Result<ExitLevels, ValidationError> {
        if !(entry.is_finite() && entry > 0.0 && invalidation.is_finite()) {
            return Err(ValidationError::new(
                RejectReason::InvalidGeometry,
                format!("entry {} invalidation {}", entry, invalidation),
            ));
        }

        let buffer = entry * self.config.stop_buffer_pct / 100.0;
        let floor = entry * self.config.min_stop_distance_pct / 100.0;
        let raw_stop = match side {
            Side::Buy => invalidation - buffer,
            Side::Sell => invalidation + buffer,
        };
        let stop_distance = (side.sign() * (entry - raw_stop)).max(floor);
        let stop_loss = entry - side.sign() * stop_distance;

        if !(stop_distance > 0.0 && stop_loss > 0.0) {
            return Err(ValidationError::new(
                RejectReason::InvalidGeometry,
                format!("{} stop {:.4} from entry {:.4}", side, stop_loss, entry),
            ));
        }

        let reward_ratio = self.config.reward_ratio(confidence);
        let take_profit = entry + side.sign() * stop_distance * reward_ratio;

        Ok(ExitLevels {
            stop_loss,
            take_profit,
            stop_distance,
            reward_ratio,
        })
    }

    /// Size a signal against an account snapshot.
    ///
    /// size = balance * risk_per_trade / stop_distance, floored to the
    /// symbol's quantity step.
    pub fn size_order(&self, signal: &Signal, account: &AccountState) -> Result<SizedOrder, ValidationError> {
        if account.daily_loss_reached(self.config.max_daily_loss) {
            return Err(ValidationError::new(
                RejectReason::DailyLossLimit,
                format!(
                    "daily P&L {:.2} vs limit {:.2}",
                    account.daily_realized_pnl,
                    -self.config.max_daily_loss * account.day_start_balance
                ),
            ));
        }

        let stop_distance = signal.stop_distance();
        if !(stop_distance > 0.0 && stop_distance.is_finite()) {
            return Err(ValidationError::new(
                RejectReason::InvalidGeometry,
                format!("stop distance {}", stop_distance),
            ));
        }

        let step = self.config.qty_step.get(&signal.symbol);
        let budget = account.balance * self.config.risk_per_trade;
        let size = floor_to_step(budget / stop_distance, step);
        if size < step - EPSILON {
            return Err(ValidationError::new(
                RejectReason::SizeBelowMinimum,
                format!("{:.8} below step {} (budget {:.2}, stop {:.4})", budget / stop_distance, step, budget, stop_distance),
            ));
        }

        let risk_amount = size * stop_distance;
        self.check_caps(account, risk_amount)?;

        Ok(SizedOrder {
            size,
            risk_amount,
            stop_distance,
            account_version: account.version,
        })
    }

    /// Concurrent-position and portfolio-risk caps for one more position
    pub fn check_caps(&self, account: &AccountState, risk_amount: f64) -> Result<(), ValidationError> {
        if account.open_positions + 1 > self.config.max_concurrent_positions {
            return Err(ValidationError::new(
                RejectReason::RiskCapExceeded,
                format!(
                    "{} positions open (max {})",
                    account.open_positions, self.config.max_concurrent_positions
                ),
            ));
        }

        let cap = self.config.max_portfolio_risk * account.balance;
        if account.open_risk + risk_amount > cap + EPSILON {
            return Err(ValidationError::new(
                RejectReason::RiskCapExceeded,
                format!(
                    "open risk {:.2} + {:.2} exceeds {:.2}",
                    account.open_risk, risk_amount, cap
                ),
            ));
        }

        Ok(())
    }
}
