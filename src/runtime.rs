//! Async runtime: recovery, per-symbol workers and the durable writer
//!
//! ```text
//! feed ──► router ──► worker(BTCUSDT) ──┐
//!                 └─► worker(ETHUSDT) ──┼──► persister ──► store
//! emergency stop (watch) ───────────────┘
//! ```
//!
//! Each symbol is processed strictly in order by its own task; symbols
//! share only the account, which serializes its own mutations. A worker
//! wakes for feed events, emergency-stop changes and the next TTL deadline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::execution::{AccountState, ExecutionEngine, Position, PositionStatus, SharedAccount};
use crate::persistence::{retry_with_backoff, PersistRecord, PersistStats, PersistenceStore, Persister};
use crate::streams::FeedEvent;
use crate::trading_core::{EngineEvent, SymbolEngine};

const WORKER_QUEUE: usize = 256;
const PERSIST_QUEUE: usize = 4_096;

/// Global kill switch shared by every worker
#[derive(Debug, Clone)]
pub struct EmergencyStop {
    tx: Arc<watch::Sender<bool>>,
}

impl EmergencyStop {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn engage(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_engaged(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub symbol: String,
    pub events: u64,
    pub candles_skipped: u64,
    pub signals: u64,
    pub rejections: u64,
    pub positions_closed: u64,
    pub faults: u64,
}

impl WorkerStats {
    fn record(&mut self, event: &EngineEvent) {
        self.events += 1;
        match event {
            EngineEvent::CandleSkipped { .. } => self.candles_skipped += 1,
            EngineEvent::SignalGenerated(_) => self.signals += 1,
            EngineEvent::CandidateRejected { .. } => self.rejections += 1,
            EngineEvent::PositionUpdated(p) if p.status.is_closed() => self.positions_closed += 1,
            EngineEvent::Fault { .. } => self.faults += 1,
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub symbols: Vec<WorkerStats>,
    pub persistence: PersistStats,
    pub degraded: bool,
    pub account: AccountState,
}

pub struct Runtime {
    config: Arc<EngineConfig>,
    store: Arc<dyn PersistenceStore>,
    emergency: EmergencyStop,
}

impl Runtime {
    pub fn new(config: EngineConfig, store: Arc<dyn PersistenceStore>) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            store,
            emergency: EmergencyStop::new(),
        })
    }

    pub fn emergency_stop(&self) -> EmergencyStop {
        self.emergency.clone()
    }

    /// Drain the spool, load account and live positions, rebuild exposure
    async fn recover(
        &self,
        persister: &mut Persister,
        start: DateTime<Utc>,
    ) -> Result<(ExecutionEngine, BTreeMap<String, Vec<Position>>), EngineError> {
        match persister.drain_spool().await {
            Ok(0) => {}
            Ok(n) => info!("RECOVERY: wrote {} spooled records", n),
            Err(e) => warn!("RECOVERY: spool drain failed: {}", e),
        }

        let store = self.store.clone();
        let stored = retry_with_backoff(&self.config.persistence, "load account", || {
            let store = store.clone();
            async move { store.load_account_state().await }
        })
        .await?;
        let account = match stored {
            Some(account) => {
                info!("RECOVERY: account v{} | {}", account.version, account.stats_summary());
                account
            }
            None => {
                info!("RECOVERY: no stored account, starting at {:.2}", self.config.starting_balance);
                AccountState::new(self.config.starting_balance, start)
            }
        };

        let store = self.store.clone();
        let positions = retry_with_backoff(&self.config.persistence, "load positions", || {
            let store = store.clone();
            async move { store.load_open_positions().await }
        })
        .await?;

        let exec = ExecutionEngine::new(self.config.clone(), SharedAccount::new(account));
        let reconciled = exec.reconcile(&positions, start)?;
        let pending = positions.iter().filter(|p| p.status == PositionStatus::Pending).count();
        info!(
            "RECOVERY: {} live positions ({} pending) | open risk {:.2}",
            positions.len(),
            pending,
            reconciled.open_risk
        );
        if let Err(e) = persister.persist(PersistRecord::Account(reconciled)).await {
            warn!("RECOVERY: reconciled account not persisted: {}", e);
        }

        let mut by_symbol: BTreeMap<String, Vec<Position>> = BTreeMap::new();
        for position in positions {
            by_symbol.entry(position.symbol.clone()).or_default().push(position);
        }
        Ok((exec, by_symbol))
    }

    fn spawn_worker(
        &self,
        symbol: &str,
        exec: &ExecutionEngine,
        restored: Vec<Position>,
        persist: mpsc::Sender<PersistRecord>,
    ) -> Result<(mpsc::Sender<FeedEvent>, JoinHandle<WorkerStats>), EngineError> {
        let mut engine = SymbolEngine::new(symbol, self.config.clone())?;
        for position in restored {
            engine.restore_position(position);
        }
        let (tx, rx) = mpsc::channel(WORKER_QUEUE);
        let handle = tokio::spawn(symbol_worker(engine, exec.clone(), rx, self.emergency.subscribe(), persist));
        info!("WORKER: started {}", symbol);
        Ok((tx, handle))
    }

    /// Run until the feed closes. `start` dates a fresh account and the
    /// recovery reconciliation.
    pub async fn run(self, mut feed: mpsc::Receiver<FeedEvent>, start: DateTime<Utc>) -> Result<RunSummary, EngineError> {
        let mut persister = Persister::new(self.store.clone(), self.config.persistence.clone());
        let (exec, restored) = self.recover(&mut persister, start).await?;
        let degraded = persister.degraded();

        let (persist_tx, persist_rx) = mpsc::channel(PERSIST_QUEUE);
        let persist_handle = persister.spawn(persist_rx);

        let mut workers: HashMap<String, mpsc::Sender<FeedEvent>> = HashMap::new();
        let mut handles: Vec<JoinHandle<WorkerStats>> = Vec::new();

        // Symbols with live positions need a worker even before new data
        for (symbol, positions) in restored {
            let (tx, handle) = self.spawn_worker(&symbol, &exec, positions, persist_tx.clone())?;
            workers.insert(symbol, tx);
            handles.push(handle);
        }

        while let Some(event) = feed.recv().await {
            let symbol = event.symbol().to_string();
            if !workers.contains_key(&symbol) {
                let (tx, handle) = self.spawn_worker(&symbol, &exec, Vec::new(), persist_tx.clone())?;
                workers.insert(symbol.clone(), tx);
                handles.push(handle);
            }
            if let Some(tx) = workers.get(&symbol) {
                if tx.send(event).await.is_err() {
                    error!("WORKER: {} is gone, dropping its input", symbol);
                }
            }
        }

        info!("FEED CLOSED: stopping {} workers", workers.len());
        drop(workers);
        let mut symbols = Vec::new();
        for result in futures::future::join_all(handles).await {
            match result {
                Ok(stats) => symbols.push(stats),
                Err(e) => error!("WORKER: task failed: {}", e),
            }
        }
        symbols.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        drop(persist_tx);
        let persistence = persist_handle
            .await
            .map_err(|e| EngineError::Concurrency(format!("persister task failed: {}", e)))?;

        Ok(RunSummary {
            symbols,
            persistence,
            degraded: degraded.load(Ordering::SeqCst),
            account: exec.account().snapshot()?,
        })
    }
}

/// Wall-clock wait until an event-time deadline. Nothing is armed before
/// the first feed event sets the clock, so restored positions keep their TTL.
fn deadline_wait(deadline: Option<DateTime<Utc>>, clock: Option<DateTime<Utc>>) -> Option<Duration> {
    match (deadline, clock) {
        (Some(d), Some(now)) => Some((d - now).to_std().unwrap_or(Duration::ZERO)),
        _ => None,
    }
}

async fn forward(
    events: Vec<EngineEvent>,
    stats: &mut WorkerStats,
    persist: &mpsc::Sender<PersistRecord>,
) {
    for event in events {
        stats.record(&event);
        if let Some(record) = PersistRecord::from_event(&event) {
            if persist.send(record).await.is_err() {
                error!("PERSIST: writer gone, {} lost", stats.symbol);
            }
        }
    }
}

async fn symbol_worker(
    mut engine: SymbolEngine,
    exec: ExecutionEngine,
    mut rx: mpsc::Receiver<FeedEvent>,
    mut halt: watch::Receiver<bool>,
    persist: mpsc::Sender<PersistRecord>,
) -> WorkerStats {
    let mut stats = WorkerStats {
        symbol: engine.symbol().to_string(),
        ..Default::default()
    };

    if *halt.borrow_and_update() {
        let at = engine.clock().unwrap_or_else(Utc::now);
        let events = engine.set_halted(true, at, &exec);
        forward(events, &mut stats, &persist).await;
    }

    let mut halt_open = true;
    loop {
        let deadline = engine.next_deadline();
        let wait = deadline_wait(deadline, engine.clock());

        tokio::select! {
            biased;

            changed = halt.changed(), if halt_open => {
                if changed.is_err() {
                    halt_open = false;
                    continue;
                }
                let engaged = *halt.borrow_and_update();
                let at = engine.clock().unwrap_or_else(Utc::now);
                let events = engine.set_halted(engaged, at, &exec);
                forward(events, &mut stats, &persist).await;
            }

            maybe = rx.recv() => {
                let Some(event) = maybe else { break };
                let events = match event {
                    FeedEvent::Candle(candle) => engine.on_candle(candle, &exec, Utc::now()),
                    FeedEvent::Tick(tick) => engine.on_tick(tick, &exec),
                };
                forward(events, &mut stats, &persist).await;
            }

            _ = tokio::time::sleep(wait.unwrap_or_default()), if wait.is_some() => {
                if let Some(at) = deadline {
                    let events = engine.expire(at, &exec);
                    forward(events, &mut stats, &persist).await;
                }
            }
        }
    }

    info!(
        "WORKER: {} done | {} signals | {} rejected | {} closed",
        stats.symbol, stats.signals, stats.rejections, stats.positions_closed
    );
    stats
}
