//! In-memory store with failure injection

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{supersedes, PersistenceStore};
use crate::error::PersistenceError;
use crate::execution::{AccountState, Position};
use crate::trading_core::Signal;

#[derive(Debug, Default)]
pub struct MemoryStore {
    signals: RwLock<HashMap<Uuid, Signal>>,
    trades: RwLock<HashMap<Uuid, Position>>,
    account: RwLock<Option<AccountState>>,
    /// Remaining writes to fail with `Unavailable`
    failures: AtomicU32,
    /// Remaining writes to refuse permanently
    rejections: AtomicU32,
    writes: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` writes
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Refuse the next `n` writes with a non-transient error
    pub fn reject_next(&self, n: u32) {
        self.rejections.store(n, Ordering::SeqCst);
    }

    /// Successful writes so far
    pub fn write_count(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn signal(&self, id: Uuid) -> Option<Signal> {
        self.signals.read().await.get(&id).cloned()
    }

    pub async fn trade(&self, id: Uuid) -> Option<Position> {
        self.trades.read().await.get(&id).cloned()
    }

    pub async fn signal_count(&self) -> usize {
        self.signals.read().await.len()
    }

    fn check_available(&self) -> Result<(), PersistenceError> {
        let rejected = self
            .rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if rejected.is_ok() {
            return Err(PersistenceError::Codec("injected rejection".to_string()));
        }
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(PersistenceError::Unavailable("injected failure".to_string())),
            Err(_) => {
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn save_signal(&self, signal: &Signal) -> Result<(), PersistenceError> {
        self.check_available()?;
        self.signals.write().await.insert(signal.id, signal.clone());
        Ok(())
    }

    async fn save_trade(&self, position: &Position) -> Result<(), PersistenceError> {
        self.check_available()?;
        self.trades.write().await.insert(position.id, position.clone());
        Ok(())
    }

    async fn update_account_state(&self, account: &AccountState) -> Result<(), PersistenceError> {
        self.check_available()?;
        let mut stored = self.account.write().await;
        if supersedes(account, stored.as_ref()) {
            *stored = Some(account.clone());
        }
        Ok(())
    }

    async fn load_open_positions(&self) -> Result<Vec<Position>, PersistenceError> {
        let mut open: Vec<Position> = self
            .trades
            .read()
            .await
            .values()
            .filter(|p| p.is_live())
            .cloned()
            .collect();
        open.sort_by_key(|p| p.created_at);
        Ok(open)
    }

    async fn load_account_state(&self) -> Result<Option<AccountState>, PersistenceError> {
        Ok(self.account.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    #[tokio::test]
    async fn test_failure_injection_and_version_guard() {
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        store.fail_next(2);
        let mut account = AccountState::new(1_000.0, t0);
        assert!(store.update_account_state(&account).await.is_err());
        assert!(store.update_account_state(&account).await.is_err());
        store.update_account_state(&account).await.unwrap();

        account.version = 3;
        account.balance = 1_050.0;
        account.updated_at = t0 + Duration::minutes(1);
        store.update_account_state(&account).await.unwrap();

        let mut stale = AccountState::new(900.0, t0);
        stale.version = 2;
        store.update_account_state(&stale).await.unwrap();

        let loaded = store.load_account_state().await.unwrap().unwrap();
        assert_eq!(loaded.balance, 1_050.0);
        assert_eq!(store.write_count(), 3);
    }
}
