//! Write-through cache in front of a slower store
//!
//! Reads are served from memory once loaded. A write updates the cache only
//! after the inner store accepted it.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{supersedes, PersistenceStore};
use crate::error::PersistenceError;
use crate::execution::{AccountState, Position};
use crate::trading_core::Signal;

#[derive(Debug)]
pub struct CachedStore<S> {
    inner: S,
    account: RwLock<Option<Option<AccountState>>>,
    open: RwLock<Option<HashMap<Uuid, Position>>>,
}

impl<S: PersistenceStore> CachedStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            account: RwLock::new(None),
            open: RwLock::new(None),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: PersistenceStore> PersistenceStore for CachedStore<S> {
    async fn save_signal(&self, signal: &Signal) -> Result<(), PersistenceError> {
        self.inner.save_signal(signal).await
    }

    async fn save_trade(&self, position: &Position) -> Result<(), PersistenceError> {
        self.inner.save_trade(position).await?;
        if let Some(open) = self.open.write().await.as_mut() {
            if position.is_live() {
                open.insert(position.id, position.clone());
            } else {
                open.remove(&position.id);
            }
        }
        Ok(())
    }

    async fn update_account_state(&self, account: &AccountState) -> Result<(), PersistenceError> {
        self.inner.update_account_state(account).await?;
        let mut cached = self.account.write().await;
        if let Some(slot) = cached.as_mut() {
            if supersedes(account, slot.as_ref()) {
                *slot = Some(account.clone());
            }
        }
        Ok(())
    }

    async fn load_open_positions(&self) -> Result<Vec<Position>, PersistenceError> {
        if let Some(open) = self.open.read().await.as_ref() {
            let mut positions: Vec<Position> = open.values().cloned().collect();
            positions.sort_by_key(|p| p.created_at);
            return Ok(positions);
        }
        let positions = self.inner.load_open_positions().await?;
        *self.open.write().await = Some(positions.iter().map(|p| (p.id, p.clone())).collect());
        Ok(positions)
    }

    async fn load_account_state(&self) -> Result<Option<AccountState>, PersistenceError> {
        if let Some(account) = self.account.read().await.as_ref() {
            return Ok(account.clone());
        }
        let account = self.inner.load_account_state().await?;
        *self.account.write().await = Some(account.clone());
        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_failed_write_does_not_touch_cache() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let store = CachedStore::new(MemoryStore::new());
        assert_eq!(store.load_account_state().await.unwrap(), None);

        let mut account = AccountState::new(1_000.0, t0);
        account.version = 1;
        store.inner().fail_next(1);
        assert!(store.update_account_state(&account).await.is_err());
        assert_eq!(store.load_account_state().await.unwrap(), None);

        store.update_account_state(&account).await.unwrap();
        assert_eq!(store.load_account_state().await.unwrap(), Some(account));
    }
}
