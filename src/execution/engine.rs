//! Execution engine - thin client of the risk engine and the shared account
//!
//! Opening a position is read-size-commit: snapshot the account, size the
//! signal, then reserve risk against the snapshot's version. A stale version
//! means another symbol changed the account in between; the whole step is
//! retried.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use super::account::{AccountState, SharedAccount};
use super::position::Position;
use super::risk::{ExitLevels, RiskEngine};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::trading_core::signals::Signal;
use crate::types::Side;

/// Attempts for one read-size-commit cycle
const MAX_COMMIT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    risk: RiskEngine,
    account: SharedAccount,
}

impl ExecutionEngine {
    pub fn new(config: Arc<EngineConfig>, account: SharedAccount) -> Self {
        Self {
            risk: RiskEngine::new(config),
            account,
        }
    }

    pub fn risk(&self) -> &RiskEngine {
        &self.risk
    }

    pub fn account(&self) -> &SharedAccount {
        &self.account
    }

    pub fn exit_levels(
        &self,
        side: Side,
        entry: f64,
        invalidation: f64,
        confidence: f64,
    ) -> Result<ExitLevels, EngineError> {
        Ok(self.risk.exit_levels(side, entry, invalidation, confidence)?)
    }

    /// Size, reserve and create a PENDING position for `signal`
    pub fn open(&self, signal: &Signal) -> Result<(Position, AccountState), EngineError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let snapshot = self.account.snapshot()?;
            let order = self.risk.size_order(signal, &snapshot)?;

            let result = self
                .account
                .transact(|account| account.reserve(order.account_version, order.risk_amount, signal.generated_at));

            match result {
                Ok(((), account)) => {
                    let position = Position::pending(signal, &order);
                    debug!(
                        "RESERVED: {} {:.4} units | risk ${:.2} | open risk ${:.2}",
                        signal.symbol, order.size, order.risk_amount, account.open_risk
                    );
                    return Ok((position, account));
                }
                Err(EngineError::Concurrency(msg)) if attempt < MAX_COMMIT_ATTEMPTS => {
                    debug!("RETRY: {} account changed ({}), attempt {}", signal.symbol, msg, attempt);
                    continue;
                }
                Err(e) => {
                    warn!("RESERVE FAILED: {} after {} attempts: {}", signal.symbol, attempt, e);
                    return Err(e);
                }
            }
        }
    }

    /// Fold a closed position into the account
    pub fn settle(&self, position: &Position) -> Result<AccountState, EngineError> {
        let at = position.exit_time.unwrap_or(position.created_at);
        self.account
            .transact(|account| {
                account.settle(&position.symbol, position.risk_amount, position.realized_pnl, at);
                Ok(())
            })
            .map(|(_, account)| account)
    }

    /// Release the reservation of a position that expired unfilled
    pub fn release(&self, position: &Position) -> Result<AccountState, EngineError> {
        let at = position.exit_time.unwrap_or(position.created_at);
        self.account
            .transact(|account| {
                account.release(position.risk_amount, at);
                Ok(())
            })
            .map(|(_, account)| account)
    }

    pub fn mark(&self, symbol: &str, unrealized: f64) -> Result<(), EngineError> {
        self.account
            .transact(|account| {
                account.mark(symbol, unrealized);
                Ok(())
            })
            .map(|_| ())
    }

    /// Daily rollover; returns the new state when the day changed
    pub fn roll_day(&self, now: DateTime<Utc>) -> Result<Option<AccountState>, EngineError> {
        let (rolled, account) = self.account.transact(|account| Ok(account.roll_day(now)))?;
        Ok(rolled.then_some(account))
    }

    /// Rebuild aggregate exposure from recovered live positions
    pub fn reconcile(&self, positions: &[Position], at: DateTime<Utc>) -> Result<AccountState, EngineError> {
        let live: Vec<&Position> = positions.iter().filter(|p| p.is_live()).collect();
        let open_risk: f64 = live.iter().map(|p| p.risk_amount).sum();
        self.account
            .transact(|account| {
                account.reconcile(open_risk, live.len(), at);
                Ok(())
            })
            .map(|(_, account)| account)
    }
}
