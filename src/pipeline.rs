//! Synchronous multi-symbol driver
//!
//! One `SymbolEngine` per symbol, created on first sight, all sharing one
//! account through the execution engine. Used for replay and by the async
//! runtime's tests; the runtime itself runs one engine per task.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::execution::{AccountState, ExecutionEngine, Position, SharedAccount};
use crate::streams::FeedEvent;
use crate::trading_core::{EngineEvent, SymbolEngine};
use crate::types::{Candle, PriceTick};

pub struct Pipeline {
    config: Arc<EngineConfig>,
    exec: ExecutionEngine,
    engines: BTreeMap<String, SymbolEngine>,
    halted: bool,
}

impl Pipeline {
    /// Fresh account at `starting_balance`, dated `start`
    pub fn new(config: EngineConfig, start: DateTime<Utc>) -> Result<Self, EngineError> {
        let account = AccountState::new(config.starting_balance, start);
        Self::with_account(config, account)
    }

    pub fn with_account(config: EngineConfig, account: AccountState) -> Result<Self, EngineError> {
        config.validate()?;
        let config = Arc::new(config);
        let exec = ExecutionEngine::new(config.clone(), SharedAccount::new(account));
        Ok(Self {
            config,
            exec,
            engines: BTreeMap::new(),
            halted: false,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn execution(&self) -> &ExecutionEngine {
        &self.exec
    }

    pub fn account(&self) -> Result<AccountState, EngineError> {
        self.exec.account().snapshot()
    }

    pub fn symbol(&self, symbol: &str) -> Option<&SymbolEngine> {
        self.engines.get(symbol)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.engines.keys().map(|s| s.as_str())
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    fn engine(&mut self, symbol: &str) -> Result<&mut SymbolEngine, EngineError> {
        if !self.engines.contains_key(symbol) {
            let mut engine = SymbolEngine::new(symbol, self.config.clone())?;
            if self.halted {
                let at = self.exec.account().snapshot()?.updated_at;
                engine.set_halted(true, at, &self.exec);
            }
            info!("SYMBOL: tracking {}", symbol);
            self.engines.insert(symbol.to_string(), engine);
        }
        self.engines
            .get_mut(symbol)
            .ok_or_else(|| EngineError::Configuration(format!("no engine for {}", symbol)))
    }

    fn fault(symbol: &str, e: EngineError) -> Vec<EngineEvent> {
        warn!("{}: {}", symbol, e);
        vec![EngineEvent::Fault {
            symbol: symbol.to_string(),
            message: e.to_string(),
        }]
    }

    pub fn on_candle(&mut self, candle: Candle, now: DateTime<Utc>) -> Vec<EngineEvent> {
        let symbol = candle.symbol.clone();
        let exec = self.exec.clone();
        match self.engine(&symbol) {
            Ok(engine) => engine.on_candle(candle, &exec, now),
            Err(e) => Self::fault(&symbol, e),
        }
    }

    pub fn on_tick(&mut self, tick: PriceTick) -> Vec<EngineEvent> {
        let symbol = tick.symbol.clone();
        let exec = self.exec.clone();
        match self.engine(&symbol) {
            Ok(engine) => engine.on_tick(tick, &exec),
            Err(e) => Self::fault(&symbol, e),
        }
    }

    pub fn on_event(&mut self, event: FeedEvent, now: DateTime<Utc>) -> Vec<EngineEvent> {
        match event {
            FeedEvent::Candle(candle) => self.on_candle(candle, now),
            FeedEvent::Tick(tick) => self.on_tick(tick),
        }
    }

    /// Engage or clear the global emergency stop. Engaging flattens every
    /// symbol before returning.
    pub fn set_emergency_stop(&mut self, engaged: bool, at: DateTime<Utc>) -> Vec<EngineEvent> {
        if engaged != self.halted {
            if engaged {
                warn!("EMERGENCY STOP ENGAGED at {}", at);
            } else {
                info!("EMERGENCY STOP CLEARED at {}", at);
            }
        }
        self.halted = engaged;
        let exec = self.exec.clone();
        self.engines
            .values_mut()
            .flat_map(|engine| engine.set_halted(engaged, at, &exec))
            .collect()
    }

    /// TTL sweep across every symbol
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<EngineEvent> {
        let exec = self.exec.clone();
        self.engines
            .values_mut()
            .flat_map(|engine| engine.expire(now, &exec))
            .collect()
    }

    /// Re-attach recovered positions and rebuild exposure from them
    pub fn restore(&mut self, positions: Vec<Position>, at: DateTime<Utc>) -> Result<AccountState, EngineError> {
        let account = self.exec.reconcile(&positions, at)?;
        for position in positions {
            let symbol = position.symbol.clone();
            self.engine(&symbol)?.restore_position(position);
        }
        Ok(account)
    }
}
