//! Account state and its single-writer wrapper
//!
//! Every balance or risk mutation goes through `SharedAccount::transact`,
//! which applies the change to a copy under the lock and commits only on
//! success. `version` increases on each committed change that affects
//! sizing. A reservation checks the version it was sized against and fails
//! with `EngineError::Concurrency` if another symbol got there first.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub balance: f64,
    /// Balance plus unrealized P&L of open positions
    pub equity: f64,
    /// Sum of risk_amount over PENDING and OPEN positions
    pub open_risk: f64,
    pub open_positions: usize,
    pub realized_pnl: f64,
    pub trade_count: u32,
    pub wins: u32,
    pub losses: u32,
    pub day: NaiveDate,
    pub day_start_balance: f64,
    pub daily_realized_pnl: f64,
    pub daily_loss_count: u32,
    #[serde(default)]
    pub unrealized: BTreeMap<String, f64>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl AccountState {
    pub fn new(balance: f64, now: DateTime<Utc>) -> Self {
        Self {
            balance,
            equity: balance,
            open_risk: 0.0,
            open_positions: 0,
            realized_pnl: 0.0,
            trade_count: 0,
            wins: 0,
            losses: 0,
            day: now.date_naive(),
            day_start_balance: balance,
            daily_realized_pnl: 0.0,
            daily_loss_count: 0,
            unrealized: BTreeMap::new(),
            version: 0,
            updated_at: now,
        }
    }

    fn recompute_equity(&mut self) {
        self.equity = self.balance + self.unrealized.values().sum::<f64>();
    }

    /// Reset daily counters on the first event of a new UTC day
    pub fn roll_day(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if today <= self.day {
            return false;
        }
        info!(
            "NEW DAY {}: balance {:.2} | prior day P&L {:.2} ({} losses)",
            today, self.balance, self.daily_realized_pnl, self.daily_loss_count
        );
        self.day = today;
        self.day_start_balance = self.balance;
        self.daily_realized_pnl = 0.0;
        self.daily_loss_count = 0;
        self.version += 1;
        self.updated_at = now;
        true
    }

    pub fn daily_loss_reached(&self, max_daily_loss: f64) -> bool {
        self.daily_realized_pnl <= -max_daily_loss * self.day_start_balance
    }

    /// Reserve risk for a new PENDING position sized at `expected_version`
    pub fn reserve(&mut self, expected_version: u64, risk_amount: f64, at: DateTime<Utc>) -> Result<(), EngineError> {
        if self.version != expected_version {
            return Err(EngineError::Concurrency(format!(
                "sized against v{}, account at v{}",
                expected_version, self.version
            )));
        }
        self.open_risk += risk_amount;
        self.open_positions += 1;
        self.version += 1;
        self.updated_at = at;
        Ok(())
    }

    /// Give back the reservation of a position that never filled
    pub fn release(&mut self, risk_amount: f64, at: DateTime<Utc>) {
        self.open_risk = (self.open_risk - risk_amount).max(0.0);
        self.open_positions = self.open_positions.saturating_sub(1);
        self.version += 1;
        self.updated_at = at;
    }

    /// Fold a closed position into the account
    pub fn settle(&mut self, symbol: &str, risk_amount: f64, pnl: f64, at: DateTime<Utc>) {
        self.open_risk = (self.open_risk - risk_amount).max(0.0);
        self.open_positions = self.open_positions.saturating_sub(1);
        self.balance += pnl;
        self.realized_pnl += pnl;
        self.daily_realized_pnl += pnl;
        self.trade_count += 1;
        if pnl > 0.0 {
            self.wins += 1;
        } else {
            self.losses += 1;
            self.daily_loss_count += 1;
        }
        self.unrealized.remove(symbol);
        self.recompute_equity();
        self.version += 1;
        self.updated_at = at;
    }

    /// Mark-to-market only; does not affect sizing so the version is kept
    pub fn mark(&mut self, symbol: &str, unrealized: f64) {
        if unrealized == 0.0 {
            self.unrealized.remove(symbol);
        } else {
            self.unrealized.insert(symbol.to_string(), unrealized);
        }
        self.recompute_equity();
    }

    /// Rebuild exposure from recovered positions; logs any drift
    pub fn reconcile(&mut self, open_risk: f64, open_positions: usize, at: DateTime<Utc>) {
        if (self.open_risk - open_risk).abs() > 1e-9 || self.open_positions != open_positions {
            warn!(
                "RECOVERY: account exposure {:.2}/{} differs from positions {:.2}/{}; using positions",
                self.open_risk, self.open_positions, open_risk, open_positions
            );
        }
        self.open_risk = open_risk;
        self.open_positions = open_positions;
        self.unrealized.clear();
        self.recompute_equity();
        self.version += 1;
        self.updated_at = at;
    }

    pub fn win_rate(&self) -> f64 {
        if self.trade_count == 0 {
            0.0
        } else {
            self.wins as f64 / self.trade_count as f64
        }
    }

    pub fn stats_summary(&self) -> String {
        format!(
            "Balance: ${:.2} | Equity: ${:.2} | Day P&L: ${:.2} | Trades: {} | WR: {:.1}% | Open risk: ${:.2} ({} open)",
            self.balance,
            self.equity,
            self.daily_realized_pnl,
            self.trade_count,
            self.win_rate() * 100.0,
            self.open_risk,
            self.open_positions
        )
    }
}

/// The only writer of `AccountState`
#[derive(Debug, Clone)]
pub struct SharedAccount {
    inner: Arc<Mutex<AccountState>>,
}

impl SharedAccount {
    pub fn new(state: AccountState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub fn snapshot(&self) -> Result<AccountState, EngineError> {
        self.inner
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| EngineError::Concurrency("account lock poisoned".to_string()))
    }

    /// Apply `f` to a copy and commit it only if `f` succeeds
    pub fn transact<T>(
        &self,
        f: impl FnOnce(&mut AccountState) -> Result<T, EngineError>,
    ) -> Result<(T, AccountState), EngineError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| EngineError::Concurrency("account lock poisoned".to_string()))?;
        let mut draft = guard.clone();
        let value = f(&mut draft)?;
        *guard = draft.clone();
        Ok((value, draft))
    }

    pub fn replace(&self, state: AccountState) -> Result<(), EngineError> {
        self.transact(|account| {
            *account = state;
            Ok(())
        })
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_reserve_checks_version() {
        let shared = SharedAccount::new(AccountState::new(1_000.0, t0()));
        let seen = shared.snapshot().unwrap().version;

        shared.transact(|a| a.reserve(seen, 10.0, t0())).unwrap();
        let err = shared.transact(|a| a.reserve(seen, 10.0, t0())).unwrap_err();
        assert!(matches!(err, EngineError::Concurrency(_)));

        let state = shared.snapshot().unwrap();
        assert_eq!(state.open_positions, 1);
        assert_eq!(state.open_risk, 10.0);
    }

    #[test]
    fn test_failed_transaction_leaves_state() {
        let shared = SharedAccount::new(AccountState::new(1_000.0, t0()));
        let result: Result<((), AccountState), EngineError> = shared.transact(|a| {
            a.balance = 0.0;
            Err(EngineError::Concurrency("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(shared.snapshot().unwrap().balance, 1_000.0);
    }

    #[test]
    fn test_settle_and_daily_roll() {
        let mut account = AccountState::new(1_000.0, t0());
        account.reserve(0, 10.0, t0()).unwrap();
        account.mark("BTCUSDT", -4.0);
        assert_eq!(account.equity, 996.0);
        assert_eq!(account.version, 1);

        account.settle("BTCUSDT", 10.0, -10.0, t0());
        assert_eq!(account.balance, 990.0);
        assert_eq!(account.equity, 990.0);
        assert_eq!(account.open_risk, 0.0);
        assert_eq!(account.open_positions, 0);
        assert_eq!(account.daily_loss_count, 1);
        assert!(account.daily_loss_reached(0.01));

        assert!(!account.roll_day(t0() + Duration::hours(1)));
        assert!(account.roll_day(t0() + Duration::days(1)));
        assert_eq!(account.day_start_balance, 990.0);
        assert_eq!(account.daily_realized_pnl, 0.0);
        assert!(!account.daily_loss_reached(0.01));
    }

    #[test]
    fn test_state_round_trips_json() {
        let mut account = AccountState::new(500.0, t0());
        account.mark("ETHUSDT", 2.5);
        let json = serde_json::to_string(&account).unwrap();
        let back: AccountState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, account);
    }
}
