//! Durable writer task
//!
//! Records are written in arrival order. A transient store failure is
//! retried with capped exponential backoff plus jitter; once attempts run
//! out the record is appended to the spool (a JSONL file, or memory when no
//! path is configured) and the writer reports itself degraded. The spool is
//! drained oldest-first before the next fresh record and at startup.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::PersistenceStore;
use crate::config::PersistenceConfig;
use crate::error::PersistenceError;
use crate::execution::{AccountState, Position};
use crate::trading_core::{EngineEvent, Signal};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", content = "data", rename_all = "snake_case")]
pub enum PersistRecord {
    Signal(Signal),
    Trade(Position),
    Account(AccountState),
}

impl PersistRecord {
    /// Events that change durable state
    pub fn from_event(event: &EngineEvent) -> Option<Self> {
        match event {
            EngineEvent::SignalGenerated(s) | EngineEvent::SignalUpdated(s) => Some(PersistRecord::Signal(s.clone())),
            EngineEvent::PositionUpdated(p) => Some(PersistRecord::Trade(p.clone())),
            EngineEvent::AccountUpdated(a) => Some(PersistRecord::Account(a.clone())),
            _ => None,
        }
    }

    pub fn label(&self) -> String {
        match self {
            PersistRecord::Signal(s) => format!("signal {} {}", s.id, s.status),
            PersistRecord::Trade(p) => format!("trade {} {}", p.id, p.status),
            PersistRecord::Account(a) => format!("account v{}", a.version),
        }
    }

    pub async fn write_to(&self, store: &dyn PersistenceStore) -> Result<(), PersistenceError> {
        match self {
            PersistRecord::Signal(s) => store.save_signal(s).await,
            PersistRecord::Trade(p) => store.save_trade(p).await,
            PersistRecord::Account(a) => store.update_account_state(a).await,
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or `max_attempts` is hit
pub async fn retry_with_backoff<T, F, Fut>(
    config: &PersistenceConfig,
    label: &str,
    mut op: F,
) -> Result<T, PersistenceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PersistenceError>>,
{
    let mut attempt = 0;
    let mut delay = config.initial_backoff_ms;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < config.max_attempts => {
                let jitter = rand::thread_rng().gen_range(0..=delay / 2);
                warn!(
                    "PERSIST: {} failed ({}). Retry in {}ms ({}/{})",
                    label,
                    e,
                    delay + jitter,
                    attempt,
                    config.max_attempts
                );
                tokio::time::sleep(Duration::from_millis(delay + jitter)).await;
                delay = (delay * 2).min(config.max_backoff_ms);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Records the store has not accepted yet
#[derive(Debug)]
enum Spool {
    File(PathBuf),
    Memory(VecDeque<PersistRecord>),
}

impl Spool {
    async fn push(&mut self, record: &PersistRecord) -> Result<(), PersistenceError> {
        match self {
            Spool::Memory(queue) => {
                queue.push_back(record.clone());
                Ok(())
            }
            Spool::File(path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let mut line = serde_json::to_vec(record)?;
                line.push(b'\n');
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&*path)
                    .await?;
                file.write_all(&line).await?;
                file.sync_data().await?;
                Ok(())
            }
        }
    }

    async fn load(&self) -> Result<Vec<PersistRecord>, PersistenceError> {
        match self {
            Spool::Memory(queue) => Ok(queue.iter().cloned().collect()),
            Spool::File(path) => {
                let raw = match tokio::fs::read_to_string(path).await {
                    Ok(raw) => raw,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                    Err(e) => return Err(e.into()),
                };
                let mut records = Vec::new();
                for (n, line) in raw.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
                    match serde_json::from_str(line) {
                        Ok(record) => records.push(record),
                        Err(e) => error!("SPOOL: dropping unreadable line {} of {}: {}", n + 1, path.display(), e),
                    }
                }
                Ok(records)
            }
        }
    }

    async fn replace(&mut self, remaining: Vec<PersistRecord>) -> Result<(), PersistenceError> {
        match self {
            Spool::Memory(queue) => {
                *queue = remaining.into();
                Ok(())
            }
            Spool::File(path) => {
                if remaining.is_empty() {
                    match tokio::fs::remove_file(&*path).await {
                        Ok(()) => Ok(()),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                        Err(e) => Err(e.into()),
                    }
                } else {
                    let mut body = Vec::new();
                    for record in &remaining {
                        body.extend(serde_json::to_vec(record)?);
                        body.push(b'\n');
                    }
                    let tmp = path.with_extension("tmp");
                    tokio::fs::write(&tmp, body).await?;
                    tokio::fs::rename(&tmp, &*path).await?;
                    Ok(())
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistStats {
    pub written: u64,
    pub retried_from_spool: u64,
    pub spooled: u64,
    /// Records neither written nor kept in the spool
    pub lost: u64,
}

pub struct Persister {
    store: Arc<dyn PersistenceStore>,
    config: PersistenceConfig,
    spool: Spool,
    spooled: usize,
    degraded: Arc<AtomicBool>,
    stats: PersistStats,
}

impl Persister {
    pub fn new(store: Arc<dyn PersistenceStore>, config: PersistenceConfig) -> Self {
        let spool = match &config.spool_path {
            Some(path) => Spool::File(path.clone()),
            None => Spool::Memory(VecDeque::new()),
        };
        Self {
            store,
            config,
            spool,
            spooled: 0,
            degraded: Arc::new(AtomicBool::new(false)),
            stats: PersistStats::default(),
        }
    }

    /// Shared flag; true while records are waiting in the spool
    pub fn degraded(&self) -> Arc<AtomicBool> {
        self.degraded.clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PersistStats {
        self.stats
    }

    async fn write_once(&self, record: &PersistRecord) -> Result<(), PersistenceError> {
        let store = self.store.clone();
        let label = record.label();
        retry_with_backoff(&self.config, &label, || {
            let store = store.clone();
            async move { record.write_to(store.as_ref()).await }
        })
        .await
    }

    /// Write one record durably; on exhaustion the record is spooled
    pub async fn persist(&mut self, record: PersistRecord) -> Result<(), PersistenceError> {
        if self.spooled > 0 {
            if let Err(e) = self.drain_spool().await {
                warn!("SPOOL: drain failed, queueing {} behind it: {}", record.label(), e);
            }
        }
        if self.spooled > 0 {
            // Keep order behind what is already waiting
            return self.spool_record(&record).await;
        }

        match self.write_once(&record).await {
            Ok(()) => {
                self.stats.written += 1;
                debug!("PERSISTED: {}", record.label());
                Ok(())
            }
            Err(e) => {
                warn!("PERSIST: {} gave up after retries: {}", record.label(), e);
                self.spool_record(&record).await
            }
        }
    }

    async fn spool_record(&mut self, record: &PersistRecord) -> Result<(), PersistenceError> {
        match self.spool.push(record).await {
            Ok(()) => {
                self.spooled += 1;
                self.stats.spooled += 1;
                if !self.degraded.swap(true, Ordering::SeqCst) {
                    warn!("PERSIST DEGRADED: store unavailable, spooling {}", record.label());
                }
                Ok(())
            }
            Err(e) => {
                self.stats.lost += 1;
                error!("PERSIST: cannot spool {}: {}", record.label(), e);
                Err(e)
            }
        }
    }

    /// Replay spooled records oldest first. Stops at the first record the
    /// store still refuses transiently; a record it rejects outright is
    /// dropped and counted as lost.
    pub async fn drain_spool(&mut self) -> Result<usize, PersistenceError> {
        let records = self.spool.load().await?;
        if records.is_empty() {
            self.spooled = 0;
            self.degraded.store(false, Ordering::SeqCst);
            return Ok(0);
        }

        let mut written = 0;
        let mut remaining = Vec::new();
        let mut queue = records.into_iter();
        while let Some(record) = queue.next() {
            match record.write_to(self.store.as_ref()).await {
                Ok(()) => written += 1,
                Err(e) if e.is_transient() => {
                    debug!("SPOOL: {} still failing: {}", record.label(), e);
                    remaining.push(record);
                    remaining.extend(queue.by_ref());
                    break;
                }
                Err(e) => {
                    self.stats.lost += 1;
                    error!("SPOOL: dropping {}, store rejected it: {}", record.label(), e);
                }
            }
        }

        self.spooled = remaining.len();
        self.spool.replace(remaining).await?;
        self.stats.retried_from_spool += written as u64;

        if self.spooled == 0 {
            self.degraded.store(false, Ordering::SeqCst);
            info!("PERSIST RECOVERED: {} spooled records written", written);
        }
        Ok(written)
    }

    /// Consume records until every sender is dropped
    pub async fn run(mut self, mut rx: mpsc::Receiver<PersistRecord>) -> PersistStats {
        if let Err(e) = self.drain_spool().await {
            warn!("SPOOL: startup drain failed: {}", e);
        }
        while let Some(record) = rx.recv().await {
            // Failures are already logged and counted
            let _ = self.persist(record).await;
        }
        if self.spooled > 0 {
            if let Err(e) = self.drain_spool().await {
                warn!("SPOOL: final drain failed: {}", e);
            }
        }
        if self.spooled > 0 {
            warn!("PERSIST: {} records remain spooled at shutdown", self.spooled);
        }
        self.stats
    }

    pub fn spawn(self, rx: mpsc::Receiver<PersistRecord>) -> tokio::task::JoinHandle<PersistStats> {
        tokio::spawn(self.run(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn fast() -> PersistenceConfig {
        PersistenceConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            spool_path: None,
        }
    }

    fn account(version: u64) -> PersistRecord {
        let mut state = AccountState::new(1_000.0, Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
        state.version = version;
        PersistRecord::Account(state)
    }

    #[tokio::test]
    async fn test_retry_recovers_transient_failure() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next(2);
        let mut persister = Persister::new(store.clone(), fast());

        persister.persist(account(1)).await.unwrap();
        assert!(!persister.is_degraded());
        assert_eq!(persister.stats().written, 1);
        assert_eq!(store.load_account_state().await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_exhaustion_spools_then_drains_in_order() {
        let store = Arc::new(MemoryStore::new());
        let mut persister = Persister::new(store.clone(), fast());

        store.fail_next(3);
        persister.persist(account(1)).await.unwrap();
        assert!(persister.is_degraded());
        assert_eq!(persister.stats().spooled, 1);
        assert!(store.load_account_state().await.unwrap().is_none());

        persister.persist(account(2)).await.unwrap();
        assert!(!persister.is_degraded());
        assert_eq!(persister.stats().retried_from_spool, 1);
        assert_eq!(store.load_account_state().await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_file_spool_survives_restart() {
        let path = std::env::temp_dir().join(format!("confluence-spool-{}.jsonl", Uuid::new_v4()));
        let config = PersistenceConfig {
            spool_path: Some(path.clone()),
            ..fast()
        };

        let down = Arc::new(MemoryStore::new());
        down.fail_next(u32::MAX);
        let mut persister = Persister::new(down, config.clone());
        persister.persist(account(4)).await.unwrap();
        assert!(path.exists());

        let up = Arc::new(MemoryStore::new());
        let mut persister = Persister::new(up.clone(), config);
        assert_eq!(persister.drain_spool().await.unwrap(), 1);
        assert!(!path.exists());
        assert_eq!(up.load_account_state().await.unwrap().unwrap().version, 4);
    }

    #[tokio::test]
    async fn test_rejected_spool_record_does_not_block_the_rest() {
        let store = Arc::new(MemoryStore::new());
        let mut persister = Persister::new(store.clone(), fast());

        store.fail_next(3);
        persister.persist(account(1)).await.unwrap();
        assert!(persister.is_degraded());

        store.reject_next(1);
        persister.persist(account(2)).await.unwrap();
        assert!(!persister.is_degraded());
        assert_eq!(persister.stats().lost, 1);
        assert_eq!(persister.stats().retried_from_spool, 0);
        assert_eq!(persister.stats().written, 1);
        assert_eq!(store.load_account_state().await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_unreadable_spool_counts_record_as_lost() {
        let path = std::env::temp_dir().join(format!("confluence-spool-{}.jsonl", Uuid::new_v4()));
        let config = PersistenceConfig {
            spool_path: Some(path.clone()),
            ..fast()
        };
        let store = Arc::new(MemoryStore::new());
        let mut persister = Persister::new(store.clone(), config);

        store.fail_next(3);
        persister.persist(account(1)).await.unwrap();
        assert!(persister.is_degraded());

        // The spool can neither be read nor appended to
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        assert!(persister.persist(account(2)).await.is_err());
        assert_eq!(persister.stats().lost, 1);
        assert!(persister.is_degraded());

        std::fs::remove_dir(&path).unwrap();
        persister.persist(account(3)).await.unwrap();
        assert!(!persister.is_degraded());
        assert_eq!(store.load_account_state().await.unwrap().unwrap().version, 3);
    }

    #[tokio::test]
    async fn test_channel_writer() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::channel(8);
        let handle = Persister::new(store.clone(), fast()).spawn(rx);
        tx.send(account(1)).await.unwrap();
        tx.send(account(2)).await.unwrap();
        drop(tx);
        let stats = handle.await.unwrap();
        assert_eq!(stats.written, 2);
        assert_eq!(store.load_account_state().await.unwrap().unwrap().version, 2);
    }
}
