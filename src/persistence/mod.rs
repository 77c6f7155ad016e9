//! Durable storage contract
//!
//! Writes are idempotent by id (signals and positions) or by version
//! (account state), so a retried or replayed write never duplicates or
//! regresses state.

use async_trait::async_trait;

use crate::error::PersistenceError;
use crate::execution::{AccountState, Position};
use crate::trading_core::Signal;

pub mod cached;
pub mod file;
pub mod memory;
pub mod writer;

pub use cached::CachedStore;
pub use file::FileStore;
pub use memory::MemoryStore;
pub use writer::{retry_with_backoff, PersistRecord, PersistStats, Persister};

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Upsert by signal id
    async fn save_signal(&self, signal: &Signal) -> Result<(), PersistenceError>;

    /// Upsert by position id
    async fn save_trade(&self, position: &Position) -> Result<(), PersistenceError>;

    /// Keep the state unless an equal or newer version is already stored
    async fn update_account_state(&self, account: &AccountState) -> Result<(), PersistenceError>;

    /// PENDING and OPEN positions, for crash recovery
    async fn load_open_positions(&self) -> Result<Vec<Position>, PersistenceError>;

    async fn load_account_state(&self) -> Result<Option<AccountState>, PersistenceError>;
}

/// Version check shared by the stores
pub(crate) fn supersedes(incoming: &AccountState, stored: Option<&AccountState>) -> bool {
    stored.map_or(true, |s| {
        incoming.version > s.version || (incoming.version == s.version && incoming.updated_at >= s.updated_at)
    })
}
