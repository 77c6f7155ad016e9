//! Position lifecycle
//!
//! `PENDING -> OPEN -> {CLOSED_STOP, CLOSED_TARGET, CLOSED_MANUAL}` and
//! `PENDING -> EXPIRED`. When one tick or candle crosses both stop and
//! target the position closes at the stop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;
use uuid::Uuid;

use super::risk::SizedOrder;
use crate::error::EngineError;
use crate::trading_core::signals::Signal;
use crate::types::{Candle, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Pending,
    Open,
    ClosedStop,
    ClosedTarget,
    ClosedManual,
    Expired,
}

impl PositionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PositionStatus::Pending | PositionStatus::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            PositionStatus::ClosedStop | PositionStatus::ClosedTarget | PositionStatus::ClosedManual
        )
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionStatus::Pending => write!(f, "PENDING"),
            PositionStatus::Open => write!(f, "OPEN"),
            PositionStatus::ClosedStop => write!(f, "CLOSED_STOP"),
            PositionStatus::ClosedTarget => write!(f, "CLOSED_TARGET"),
            PositionStatus::ClosedManual => write!(f, "CLOSED_MANUAL"),
            PositionStatus::Expired => write!(f, "EXPIRED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub signal_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    /// Limit entry price
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub risk_amount: f64,
    pub status: PositionStatus,
    pub created_at: DateTime<Utc>,
    /// Unfilled positions expire here
    pub expires_at: DateTime<Utc>,
    pub entry_time: Option<DateTime<Utc>>,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
}

impl Position {
    pub fn pending(signal: &Signal, order: &SizedOrder) -> Self {
        Self {
            id: Uuid::new_v4(),
            signal_id: signal.id,
            symbol: signal.symbol.clone(),
            side: signal.side,
            size: order.size,
            entry_price: signal.entry,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            risk_amount: order.risk_amount,
            status: PositionStatus::Pending,
            created_at: signal.generated_at,
            expires_at: signal.expires_at,
            entry_time: None,
            exit_price: None,
            exit_time: None,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
        }
    }

    pub fn stop_distance(&self) -> f64 {
        (self.entry_price - self.stop_loss).abs()
    }

    pub fn pnl_at(&self, price: f64) -> f64 {
        self.side.sign() * (price - self.entry_price) * self.size
    }

    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn fill(&mut self, at: DateTime<Utc>) -> Result<(), EngineError> {
        if self.status != PositionStatus::Pending {
            return Err(EngineError::InvalidTransition(format!(
                "{} cannot fill from {}",
                self.id, self.status
            )));
        }
        self.status = PositionStatus::Open;
        self.entry_time = Some(at);
        info!(
            "FILL: {} {} {:.4} @ {:.2} | SL {:.2} | TP {:.2}",
            self.symbol, self.side, self.size, self.entry_price, self.stop_loss, self.take_profit
        );
        Ok(())
    }

    /// Close an OPEN position; realized PnL is returned
    pub fn close(&mut self, status: PositionStatus, price: f64, at: DateTime<Utc>) -> Result<f64, EngineError> {
        if self.status != PositionStatus::Open || !status.is_closed() {
            return Err(EngineError::InvalidTransition(format!(
                "{} cannot move {} -> {}",
                self.id, self.status, status
            )));
        }
        let pnl = self.pnl_at(price);
        self.status = status;
        self.exit_price = Some(price);
        self.exit_time = Some(at);
        self.realized_pnl = pnl;
        self.unrealized_pnl = 0.0;
        info!(
            "EXIT {}: {} {} @ {:.2} | P&L: {:.2}",
            status, self.symbol, self.side, price, pnl
        );
        Ok(pnl)
    }

    pub fn expire(&mut self, at: DateTime<Utc>) -> Result<(), EngineError> {
        if self.status != PositionStatus::Pending {
            return Err(EngineError::InvalidTransition(format!(
                "{} cannot expire from {}",
                self.id, self.status
            )));
        }
        self.status = PositionStatus::Expired;
        self.exit_time = Some(at);
        info!("EXPIRED: {} {} unfilled @ {:.2}", self.symbol, self.side, self.entry_price);
        Ok(())
    }

    fn entry_touched(&self, low: f64, high: f64) -> bool {
        match self.side {
            Side::Buy => low <= self.entry_price,
            Side::Sell => high >= self.entry_price,
        }
    }

    /// A bar that opens through the limit fills at its open
    fn gap_fill_price(&self, open: f64) -> f64 {
        match self.side {
            Side::Buy => open.min(self.entry_price),
            Side::Sell => open.max(self.entry_price),
        }
    }

    fn stop_hit(&self, low: f64, high: f64) -> bool {
        match self.side {
            Side::Buy => low <= self.stop_loss,
            Side::Sell => high >= self.stop_loss,
        }
    }

    fn target_hit(&self, low: f64, high: f64) -> bool {
        match self.side {
            Side::Buy => high >= self.take_profit,
            Side::Sell => low <= self.take_profit,
        }
    }
}

/// Live (PENDING/OPEN) positions of one symbol
#[derive(Debug, Clone)]
pub struct PositionBook {
    symbol: String,
    positions: Vec<Position>,
    last_price: Option<f64>,
}

impl PositionBook {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            positions: Vec::new(),
            last_price: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn last_price(&self) -> Option<f64> {
        self.last_price
    }

    pub fn add(&mut self, position: Position) {
        self.positions.push(position);
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.positions
            .iter()
            .filter(|p| p.status == PositionStatus::Open)
            .map(|p| p.unrealized_pnl)
            .sum()
    }

    pub fn next_expiry(&self) -> Option<DateTime<Utc>> {
        self.positions
            .iter()
            .filter(|p| p.status == PositionStatus::Pending)
            .map(|p| p.expires_at)
            .min()
    }

    /// Mark-to-market and stop/target evaluation on a trade price
    pub fn on_tick(&mut self, price: f64, at: DateTime<Utc>) -> Result<Vec<Position>, EngineError> {
        self.last_price = Some(price);
        self.evaluate(price, price, price, price, at, true)
    }

    /// Same evaluation against a candle's range
    pub fn on_candle(&mut self, candle: &Candle) -> Result<Vec<Position>, EngineError> {
        self.last_price = Some(candle.close);
        self.evaluate(candle.open, candle.high, candle.low, candle.close, candle.close_time(), false)
    }

    fn evaluate(
        &mut self,
        open: f64,
        high: f64,
        low: f64,
        last: f64,
        at: DateTime<Utc>,
        is_tick: bool,
    ) -> Result<Vec<Position>, EngineError> {
        let mut changed = Vec::new();

        for position in self.positions.iter_mut() {
            let mut filled_now = false;
            if position.status == PositionStatus::Pending {
                if position.expires_at <= at {
                    continue;
                }
                if position.entry_touched(low, high) {
                    if !is_tick {
                        position.entry_price = position.gap_fill_price(open);
                    }
                    position.fill(at)?;
                    filled_now = true;
                }
            }
            if position.status != PositionStatus::Open {
                continue;
            }

            let stop_hit = position.stop_hit(low, high);
            // After a same-bar fill the path to the target is unknown
            let target_hit = position.target_hit(low, high) && (is_tick || !filled_now);

            if stop_hit {
                // Gapped through: the open is the first available price
                let gapped = match position.side {
                    Side::Buy => open < position.stop_loss,
                    Side::Sell => open > position.stop_loss,
                };
                let exit = if is_tick || gapped { open } else { position.stop_loss };
                position.close(PositionStatus::ClosedStop, exit, at)?;
            } else if target_hit {
                let exit = if is_tick { last } else { position.take_profit };
                position.close(PositionStatus::ClosedTarget, exit, at)?;
            } else {
                position.unrealized_pnl = position.pnl_at(last);
            }

            if filled_now || position.status.is_terminal() {
                changed.push(position.clone());
            }
        }

        self.positions.retain(|p| p.is_live());
        Ok(changed)
    }

    /// Emergency flatten: OPEN closes at the last price, PENDING expires
    pub fn flatten(&mut self, at: DateTime<Utc>) -> Result<Vec<Position>, EngineError> {
        let mut changed = Vec::new();
        for position in self.positions.iter_mut() {
            match position.status {
                PositionStatus::Open => {
                    let price = self.last_price.unwrap_or(position.entry_price);
                    position.close(PositionStatus::ClosedManual, price, at)?;
                    changed.push(position.clone());
                }
                PositionStatus::Pending => {
                    position.expire(at)?;
                    changed.push(position.clone());
                }
                _ => {}
            }
        }
        self.positions.retain(|p| p.is_live());
        Ok(changed)
    }

    /// Expire PENDING positions whose TTL has elapsed
    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<Vec<Position>, EngineError> {
        let mut changed = Vec::new();
        for position in self.positions.iter_mut() {
            if position.status == PositionStatus::Pending && position.expires_at <= now {
                position.expire(now)?;
                changed.push(position.clone());
            }
        }
        self.positions.retain(|p| p.is_live());
        Ok(changed)
    }
}
