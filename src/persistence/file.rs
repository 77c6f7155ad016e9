//! zstd-compressed JSON files, one per record
//!
//! ```text
//! <root>/account.json.zst
//! <root>/signals/<id>.json.zst
//! <root>/trades/<id>.json.zst
//! ```
//!
//! Every write goes to a temp file first and is renamed into place, so a
//! crash never leaves a torn record.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{supersedes, PersistenceStore};
use crate::error::PersistenceError;
use crate::execution::{AccountState, Position};
use crate::trading_core::Signal;

const EXT: &str = "json.zst";
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    /// Serializes the account read-compare-write
    account_lock: Mutex<()>,
}

impl FileStore {
    /// Create the directory layout under `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("signals")).await?;
        tokio::fs::create_dir_all(root.join("trades")).await?;
        debug!("STORE: {}", root.display());
        Ok(Self {
            root,
            account_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, dir: &str, id: &str) -> PathBuf {
        self.root.join(dir).join(format!("{}.{}", id, EXT))
    }

    fn account_path(&self) -> PathBuf {
        self.root.join(format!("account.{}", EXT))
    }

    pub async fn load_signal(&self, id: &str) -> Result<Signal, PersistenceError> {
        let path = self.record_path("signals", id);
        read_record(&path)
            .await?
            .ok_or_else(|| PersistenceError::NotFound(path.display().to_string()))
    }
}

async fn write_record<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let json = serde_json::to_vec(value)?;
    let compressed = zstd::encode_all(&json[..], ZSTD_LEVEL)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, compressed).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistenceError> {
    let compressed = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let json = zstd::decode_all(&compressed[..])?;
    Ok(Some(serde_json::from_slice(&json)?))
}

#[async_trait]
impl PersistenceStore for FileStore {
    async fn save_signal(&self, signal: &Signal) -> Result<(), PersistenceError> {
        write_record(&self.record_path("signals", &signal.id.to_string()), signal).await
    }

    async fn save_trade(&self, position: &Position) -> Result<(), PersistenceError> {
        write_record(&self.record_path("trades", &position.id.to_string()), position).await
    }

    async fn update_account_state(&self, account: &AccountState) -> Result<(), PersistenceError> {
        let _guard = self.account_lock.lock().await;
        let path = self.account_path();
        let stored: Option<AccountState> = read_record(&path).await?;
        if supersedes(account, stored.as_ref()) {
            write_record(&path, account).await?;
        }
        Ok(())
    }

    async fn load_open_positions(&self) -> Result<Vec<Position>, PersistenceError> {
        let mut open = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join("trades")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(EXT) {
                continue;
            }
            match read_record::<Position>(&path).await {
                Ok(Some(position)) if position.is_live() => open.push(position),
                Ok(_) => {}
                Err(e) => warn!("RECOVERY: unreadable trade {}: {}", name, e),
            }
        }
        open.sort_by_key(|p| p.created_at);
        Ok(open)
    }

    async fn load_account_state(&self) -> Result<Option<AccountState>, PersistenceError> {
        read_record(&self.account_path()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::PositionStatus;
    use crate::types::Side;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("confluence-store-{}", Uuid::new_v4()))
    }

    fn position(status: PositionStatus) -> Position {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        Position {
            id: Uuid::new_v4(),
            signal_id: Uuid::new_v4(),
            symbol: "ETHUSDT".to_string(),
            side: Side::Sell,
            size: 0.5,
            entry_price: 2_000.0,
            stop_loss: 2_020.0,
            take_profit: 1_940.0,
            risk_amount: 10.0,
            status,
            created_at: t0,
            expires_at: t0 + chrono::Duration::hours(1),
            entry_time: None,
            exit_price: None,
            exit_time: None,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
        }
    }

    #[tokio::test]
    async fn test_positions_survive_reopen() {
        let root = temp_root();
        let store = FileStore::open(&root).await.unwrap();

        let live = position(PositionStatus::Pending);
        let mut closed = position(PositionStatus::Open);
        closed.status = PositionStatus::ClosedTarget;
        store.save_trade(&live).await.unwrap();
        store.save_trade(&closed).await.unwrap();
        // Idempotent rewrite
        store.save_trade(&live).await.unwrap();

        let account = AccountState::new(2_500.0, live.created_at);
        store.update_account_state(&account).await.unwrap();

        let reopened = FileStore::open(&root).await.unwrap();
        let open = reopened.load_open_positions().await.unwrap();
        assert_eq!(open, vec![live]);
        assert_eq!(reopened.load_account_state().await.unwrap(), Some(account));

        let missing = reopened.load_signal(&Uuid::new_v4().to_string()).await;
        assert!(matches!(missing, Err(PersistenceError::NotFound(_))));

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }
}
