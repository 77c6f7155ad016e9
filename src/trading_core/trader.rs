//! Per-symbol trading core
//!
//! Broker-agnostic orchestration for one symbol, used by both the replay
//! pipeline and the async runtime:
//! - candle ingestion into every configured timeframe
//! - top-down bias and entry candidates on the entry timeframe
//! - signal issuance and risk-checked position creation
//! - position lifecycle on ticks, candles, TTL expiry and emergency stop
//!
//! Every observable change is returned as an `EngineEvent`; the caller
//! decides what to persist.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::bias::{confidence, symbol_bias, BiasState, FrameReading, SymbolBias};
use super::fvg::FairValueGap;
use super::frame::{FrameState, FrameUpdate, Ingest, Zone};
use super::liquidity::{LiquiditySweep, PoolKind};
use super::order_block::OrderBlock;
use super::signals::{
    Candidate, ConfluenceFactor, EntryZoneKind, Signal, SignalGenerator, SignalStatus,
};
use super::structure::StructureEvent;
use crate::config::EngineConfig;
use crate::error::{EngineError, RejectReason};
use crate::execution::account::AccountState;
use crate::execution::engine::ExecutionEngine;
use crate::execution::position::{Position, PositionBook, PositionStatus};
use crate::types::{Bias, Candle, Direction, MarketRegime, PriceTick, Session, Side, Timeframe};

/// Everything the core reports back to its caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Input failed validation and was not ingested
    CandleSkipped {
        symbol: String,
        timeframe: Timeframe,
        at: DateTime<Utc>,
        reason: String,
    },
    Structure {
        symbol: String,
        timeframe: Timeframe,
        event: StructureEvent,
    },
    ZoneCreated {
        symbol: String,
        timeframe: Timeframe,
        zone: Zone,
    },
    ZoneRetired {
        symbol: String,
        timeframe: Timeframe,
        zone: Zone,
    },
    LiquiditySwept {
        symbol: String,
        timeframe: Timeframe,
        sweep: LiquiditySweep,
    },
    BiasChanged {
        symbol: String,
        from: Bias,
        to: Bias,
        anchor: Option<Timeframe>,
        at: DateTime<Utc>,
    },
    CandidateRejected {
        symbol: String,
        side: Side,
        reason: RejectReason,
        detail: String,
        at: DateTime<Utc>,
    },
    SignalGenerated(Signal),
    /// A signal left GENERATED (executed, expired or rejected)
    SignalUpdated(Signal),
    PositionUpdated(Position),
    AccountUpdated(AccountState),
    /// Unexpected internal failure; the input was otherwise processed
    Fault { symbol: String, message: String },
}

impl EngineEvent {
    pub fn signal(&self) -> Option<&Signal> {
        match self {
            EngineEvent::SignalGenerated(s) | EngineEvent::SignalUpdated(s) => Some(s),
            _ => None,
        }
    }

    pub fn position(&self) -> Option<&Position> {
        match self {
            EngineEvent::PositionUpdated(p) => Some(p),
            _ => None,
        }
    }

    pub fn rejection(&self) -> Option<RejectReason> {
        match self {
            EngineEvent::CandidateRejected { reason, .. } => Some(*reason),
            EngineEvent::SignalUpdated(s) if s.status == SignalStatus::Rejected => s.reject_reason,
            _ => None,
        }
    }
}

pub struct SymbolEngine {
    symbol: String,
    config: Arc<EngineConfig>,
    frames: BTreeMap<Timeframe, FrameState>,
    entry_timeframe: Timeframe,
    anchor_timeframe: Timeframe,
    generator: SignalGenerator,
    book: PositionBook,
    bias: SymbolBias,
    halted: bool,
    /// Latest event time seen; the engine's notion of now
    clock: Option<DateTime<Utc>>,
}

impl SymbolEngine {
    pub fn new(symbol: &str, config: Arc<EngineConfig>) -> Result<Self, EngineError> {
        let entry_timeframe = config
            .entry_timeframe()
            .ok_or_else(|| EngineError::Configuration("no timeframes configured".to_string()))?;
        let anchor_timeframe = config
            .anchor_timeframe()
            .ok_or_else(|| EngineError::Configuration("no timeframes configured".to_string()))?;

        let frames = config
            .timeframes
            .iter()
            .map(|&tf| (tf, FrameState::new(symbol, tf, &config)))
            .collect();
        let generator = SignalGenerator::new(
            symbol,
            config.confidence_threshold,
            config.cooldown(),
            config.signal_ttl(),
        );

        Ok(Self {
            symbol: symbol.to_string(),
            frames,
            entry_timeframe,
            anchor_timeframe,
            generator,
            book: PositionBook::new(symbol),
            bias: SymbolBias::neutral(),
            halted: false,
            clock: None,
            config,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn bias(&self) -> &SymbolBias {
        &self.bias
    }

    pub fn frame(&self, timeframe: Timeframe) -> Option<&FrameState> {
        self.frames.get(&timeframe)
    }

    pub fn positions(&self) -> &[Position] {
        self.book.positions()
    }

    pub fn live_signals(&self) -> &[Signal] {
        self.generator.live()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn clock(&self) -> Option<DateTime<Utc>> {
        self.clock
    }

    /// Earliest pending TTL deadline
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        match (self.book.next_expiry(), self.generator.next_expiry()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn advance_clock(&mut self, at: DateTime<Utc>) {
        if self.clock.map_or(true, |c| at > c) {
            self.clock = Some(at);
        }
    }

    /// Re-attach a live position recovered from the store
    pub fn restore_position(&mut self, position: Position) {
        if !position.is_live() || position.symbol != self.symbol {
            return;
        }
        self.generator.note_generated(position.created_at);
        info!(
            "RESTORED: {} {} {} {:.4} @ {:.2}",
            position.symbol, position.status, position.side, position.size, position.entry_price
        );
        self.book.add(position);
    }

    /// Process one closed candle. `now` is wall-clock time for the
    /// future-timestamp check.
    pub fn on_candle(&mut self, candle: Candle, exec: &ExecutionEngine, now: DateTime<Utc>) -> Vec<EngineEvent> {
        let mut events = Vec::new();

        if let Err(e) = candle.validate(now) {
            warn!("SKIP: {} {} @ {}: {}", candle.symbol, candle.timeframe, candle.open_time, e);
            events.push(EngineEvent::CandleSkipped {
                symbol: candle.symbol.clone(),
                timeframe: candle.timeframe,
                at: candle.open_time,
                reason: e.to_string(),
            });
            return events;
        }
        if !self.frames.contains_key(&candle.timeframe) {
            debug!("SKIP: {} {} not configured", candle.symbol, candle.timeframe);
            events.push(EngineEvent::CandleSkipped {
                symbol: candle.symbol.clone(),
                timeframe: candle.timeframe,
                at: candle.open_time,
                reason: "timeframe not configured".to_string(),
            });
            return events;
        }

        let at = candle.close_time();
        self.advance_clock(at);
        self.roll_day(at, exec, &mut events);
        self.expire_into(at, exec, &mut events);

        let timeframe = candle.timeframe;
        let is_entry = timeframe == self.entry_timeframe;

        let update = {
            let Some(frame) = self.frames.get_mut(&timeframe) else {
                return events;
            };
            match frame.ingest(candle.clone()) {
                Ingest::Updated(update) => update,
                Ingest::Rebuilt => {
                    self.refresh_bias(at, &mut events);
                    return events;
                }
                Ingest::Ignored(outcome) => {
                    debug!("IGNORED: {} {} @ {} ({:?})", candle.symbol, timeframe, candle.open_time, outcome);
                    return events;
                }
            }
        };

        self.report(timeframe, &update, &mut events);
        self.refresh_bias(at, &mut events);

        if is_entry {
            if self.config.evaluate_exits_on_candles {
                let changed = self.book.on_candle(&candle);
                self.apply_lifecycle(changed, exec, &mut events);
            }
            self.evaluate_entry(&candle, &update, exec, &mut events);
        }

        events
    }

    pub fn on_tick(&mut self, tick: PriceTick, exec: &ExecutionEngine) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        if let Err(e) = tick.validate() {
            warn!("SKIP: tick {} @ {}: {}", tick.symbol, tick.time, e);
            return events;
        }

        self.advance_clock(tick.time);
        self.roll_day(tick.time, exec, &mut events);
        self.expire_into(tick.time, exec, &mut events);

        let changed = self.book.on_tick(tick.price, tick.time);
        self.apply_lifecycle(changed, exec, &mut events);
        events
    }

    /// TTL sweep at `now`
    pub fn expire(&mut self, now: DateTime<Utc>, exec: &ExecutionEngine) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        self.advance_clock(now);
        self.expire_into(now, exec, &mut events);
        events
    }

    /// Engaging closes every OPEN position and expires every PENDING one
    pub fn set_halted(&mut self, halted: bool, at: DateTime<Utc>, exec: &ExecutionEngine) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        if halted == self.halted {
            return events;
        }
        self.halted = halted;

        if halted {
            warn!("EMERGENCY STOP: {} flattening {} positions", self.symbol, self.book.positions().len());
            let changed = self.book.flatten(at);
            self.apply_lifecycle(changed, exec, &mut events);
            for signal in self.generator.expire_all() {
                events.push(EngineEvent::SignalUpdated(signal));
            }
        } else {
            info!("EMERGENCY STOP CLEARED: {}", self.symbol);
        }
        events
    }

    fn roll_day(&mut self, at: DateTime<Utc>, exec: &ExecutionEngine, events: &mut Vec<EngineEvent>) {
        match exec.roll_day(at) {
            Ok(Some(account)) => events.push(EngineEvent::AccountUpdated(account)),
            Ok(None) => {}
            Err(e) => self.fault(e, events),
        }
    }

    fn expire_into(&mut self, now: DateTime<Utc>, exec: &ExecutionEngine, events: &mut Vec<EngineEvent>) {
        let changed = self.book.expire(now);
        self.apply_lifecycle(changed, exec, events);
        for signal in self.generator.expire(now) {
            events.push(EngineEvent::SignalUpdated(signal));
        }
    }

    fn fault(&self, e: EngineError, events: &mut Vec<EngineEvent>) {
        error!("{}: {}", self.symbol, e);
        events.push(EngineEvent::Fault {
            symbol: self.symbol.clone(),
            message: e.to_string(),
        });
    }

    /// Fold position transitions into the account and the signal registry
    fn apply_lifecycle(
        &mut self,
        changed: Result<Vec<Position>, EngineError>,
        exec: &ExecutionEngine,
        events: &mut Vec<EngineEvent>,
    ) {
        let changed = match changed {
            Ok(changed) => changed,
            Err(e) => return self.fault(e, events),
        };

        for position in changed {
            let account = match position.status {
                PositionStatus::Open => {
                    if let Some(signal) = self.generator.resolve(position.signal_id, SignalStatus::Executed, None) {
                        events.push(EngineEvent::SignalUpdated(signal));
                    }
                    None
                }
                PositionStatus::Expired => {
                    if let Some(signal) = self.generator.resolve(position.signal_id, SignalStatus::Expired, None) {
                        events.push(EngineEvent::SignalUpdated(signal));
                    }
                    Some(exec.release(&position))
                }
                status if status.is_closed() => Some(exec.settle(&position)),
                _ => None,
            };
            events.push(EngineEvent::PositionUpdated(position));
            match account {
                Some(Ok(account)) => events.push(EngineEvent::AccountUpdated(account)),
                Some(Err(e)) => self.fault(e, events),
                None => {}
            }
        }

        if let Err(e) = exec.mark(&self.symbol, self.book.unrealized_pnl()) {
            self.fault(e, events);
        }
    }

    fn report(&self, timeframe: Timeframe, update: &FrameUpdate, events: &mut Vec<EngineEvent>) {
        if let Some(event) = &update.structure {
            info!(
                "{}: {} {} {:?} through {:.2} (close {:.2})",
                event.kind, self.symbol, timeframe, event.direction, event.level, event.close
            );
            events.push(EngineEvent::Structure {
                symbol: self.symbol.clone(),
                timeframe,
                event: event.clone(),
            });
        }
        for zone in &update.created {
            events.push(EngineEvent::ZoneCreated {
                symbol: self.symbol.clone(),
                timeframe,
                zone: zone.clone(),
            });
        }
        for sweep in &update.sweeps {
            events.push(EngineEvent::LiquiditySwept {
                symbol: self.symbol.clone(),
                timeframe,
                sweep: sweep.clone(),
            });
        }
        for zone in &update.retired {
            events.push(EngineEvent::ZoneRetired {
                symbol: self.symbol.clone(),
                timeframe,
                zone: zone.clone(),
            });
        }
    }

    fn refresh_bias(&mut self, at: DateTime<Utc>, events: &mut Vec<EngineEvent>) {
        let states: Vec<BiasState> = self.frames.values().filter_map(|f| f.bias().cloned()).collect();
        let bias = symbol_bias(&states, self.anchor_timeframe);
        if bias.direction != self.bias.direction {
            info!(
                "BIAS: {} {} -> {} ({} strength {:.2})",
                self.symbol,
                self.bias.direction,
                bias.direction,
                self.anchor_timeframe,
                bias.strength
            );
            events.push(EngineEvent::BiasChanged {
                symbol: self.symbol.clone(),
                from: self.bias.direction,
                to: bias.direction,
                anchor: bias.anchor,
                at,
            });
        }
        self.bias = bias;
    }

    /// Touched zones on the entry timeframe become candidates. Order blocks
    /// take precedence over gaps; a zone agreeing with the symbol bias is
    /// preferred. At most one candidate per candle.
    fn pick_zone(&self, update: &FrameUpdate) -> Option<(Direction, EntryZoneKind, f64, f64, ZoneRef)> {
        let wanted = self.bias.direction.direction();
        let obs = update
            .touched_order_blocks
            .iter()
            .map(|ob| (ob.direction, EntryZoneKind::OrderBlock, ob.low, ob.high, ZoneRef::OrderBlock(ob.clone())));
        let fvgs = update
            .touched_fvgs
            .iter()
            .map(|g| (g.direction, EntryZoneKind::FairValueGap, g.low, g.high, ZoneRef::FairValueGap(g.clone())));
        let all: Vec<_> = obs.chain(fvgs).collect();

        let preferred = all.iter().position(|z| Some(z.0) == wanted).unwrap_or(0);
        all.into_iter().nth(preferred)
    }

    fn build_candidate(&self, candle: &Candle, update: &FrameUpdate) -> Option<Candidate> {
        let (direction, zone, zone_low, zone_high, zone_ref) = self.pick_zone(update)?;
        let frame = self.frames.get(&self.entry_timeframe)?;
        let entry_reading = frame.reading()?;
        let side = direction.side();
        let entry = candle.close;

        let sweep = frame.recent_sweep().filter(|s| s.direction == direction);
        let invalidation = match (side, sweep) {
            (Side::Buy, Some(s)) => zone_low.min(s.extreme),
            (Side::Buy, None) => zone_low,
            (Side::Sell, Some(s)) => zone_high.max(s.extreme),
            (Side::Sell, None) => zone_high,
        };

        let context: Vec<&FrameReading> = self
            .frames
            .iter()
            .filter(|(tf, _)| **tf != self.entry_timeframe)
            .filter_map(|(_, f)| f.reading())
            .collect();
        let confidence = confidence(direction, entry_reading, &context, &self.config.bias);

        let regime = frame.trend().map(|_| {
            if frame.recent_structure().is_some() {
                MarketRegime::Trending
            } else {
                MarketRegime::Ranging
            }
        });

        let factors = self.factors(direction, entry, frame, &zone_ref, sweep);
        let at = candle.close_time();

        Some(Candidate {
            symbol: self.symbol.clone(),
            timeframe: self.entry_timeframe,
            side,
            entry,
            zone,
            zone_low,
            zone_high,
            invalidation,
            confidence,
            factors,
            session: Session::at(at),
            regime,
            at,
        })
    }

    fn factors(
        &self,
        direction: Direction,
        entry: f64,
        frame: &FrameState,
        zone: &ZoneRef,
        sweep: Option<&LiquiditySweep>,
    ) -> Vec<ConfluenceFactor> {
        let mut factors: Vec<ConfluenceFactor> = self
            .frames
            .values()
            .filter_map(|f| f.bias())
            .filter(|b| b.direction.direction() == Some(direction))
            .map(|b| ConfluenceFactor::TimeframeTrend {
                timeframe: b.timeframe,
                bias: b.direction,
            })
            .collect();

        let timeframe = frame.timeframe();
        if let Some(event) = frame.recent_structure().filter(|e| e.direction == direction) {
            factors.push(ConfluenceFactor::StructureBreak {
                timeframe,
                kind: event.kind,
                level: event.level,
            });
        }
        factors.push(match zone {
            ZoneRef::OrderBlock(ob) => ConfluenceFactor::OrderBlock {
                timeframe,
                low: ob.low,
                high: ob.high,
            },
            ZoneRef::FairValueGap(g) => ConfluenceFactor::FairValueGap {
                timeframe,
                low: g.low,
                high: g.high,
                fill_ratio: g.fill_ratio,
            },
        });
        if let Some(s) = sweep {
            factors.push(ConfluenceFactor::LiquiditySweep {
                timeframe,
                level: s.level,
                extreme: s.extreme,
            });
        }

        // Nearest resting liquidity in the trade direction
        let target_kind = match direction {
            Direction::Bullish => PoolKind::EqualHighs,
            Direction::Bearish => PoolKind::EqualLows,
        };
        let target = frame
            .liquidity_pools()
            .iter()
            .filter(|p| p.kind == target_kind && !p.swept && !p.broken)
            .filter(|p| direction.sign() * (p.level - entry) > 0.0)
            .min_by(|a, b| (a.level - entry).abs().total_cmp(&(b.level - entry).abs()));
        if let Some(pool) = target {
            factors.push(ConfluenceFactor::LiquidityTarget {
                timeframe,
                level: pool.level,
            });
        }

        factors
    }

    fn reject(&self, candidate: &Candidate, reason: RejectReason, detail: String, events: &mut Vec<EngineEvent>) {
        debug!(
            "REJECT: {} {} @ {:.2} conf {:.2}: {} ({})",
            self.symbol, candidate.side, candidate.entry, candidate.confidence, reason, detail
        );
        events.push(EngineEvent::CandidateRejected {
            symbol: self.symbol.clone(),
            side: candidate.side,
            reason,
            detail,
            at: candidate.at,
        });
    }

    fn evaluate_entry(
        &mut self,
        candle: &Candle,
        update: &FrameUpdate,
        exec: &ExecutionEngine,
        events: &mut Vec<EngineEvent>,
    ) {
        let Some(candidate) = self.build_candidate(candle, update) else {
            return;
        };

        let regime = match self.generator.screen(&candidate, &self.bias, self.halted) {
            Ok(regime) => regime,
            Err(v) => return self.reject(&candidate, v.reason, v.detail, events),
        };

        let levels = match exec.exit_levels(candidate.side, candidate.entry, candidate.invalidation, candidate.confidence) {
            Ok(levels) => levels,
            Err(e) => {
                let reason = e.reject_reason().unwrap_or(RejectReason::InvalidGeometry);
                return self.reject(&candidate, reason, e.to_string(), events);
            }
        };

        let signal = match self.generator.issue(&candidate, regime, levels.stop_loss, levels.take_profit) {
            Ok(signal) => signal,
            Err(v) => return self.reject(&candidate, v.reason, v.detail, events),
        };
        events.push(EngineEvent::SignalGenerated(signal.clone()));

        match exec.open(&signal) {
            Ok((position, account)) => {
                info!(
                    "PENDING: {} {} {:.4} @ {:.2} | risk ${:.2} | expires {}",
                    position.symbol,
                    position.side,
                    position.size,
                    position.entry_price,
                    position.risk_amount,
                    position.expires_at
                );
                self.book.add(position.clone());
                events.push(EngineEvent::PositionUpdated(position));
                events.push(EngineEvent::AccountUpdated(account));
            }
            Err(e) => {
                let reason = e.reject_reason();
                if reason.is_none() {
                    error!("OPEN FAILED: {} signal {}: {}", self.symbol, signal.id, e);
                } else {
                    info!("SIGNAL REJECTED: {} {}: {}", self.symbol, signal.id, e);
                }
                if let Some(resolved) = self.generator.resolve(signal.id, SignalStatus::Rejected, reason) {
                    events.push(EngineEvent::SignalUpdated(resolved));
                }
            }
        }
    }
}

/// Zone an entry came from, kept for confluence reporting
#[derive(Debug, Clone)]
enum ZoneRef {
    OrderBlock(OrderBlock),
    FairValueGap(FairValueGap),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PerSymbol;
    use crate::execution::account::SharedAccount;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()
    }

    fn config() -> Arc<EngineConfig> {
        Arc::new(EngineConfig {
            timeframes: vec![Timeframe::M15],
            qty_step: PerSymbol::uniform(0.01),
            ..Default::default()
        })
    }

    fn exec(config: &Arc<EngineConfig>) -> ExecutionEngine {
        ExecutionEngine::new(
            config.clone(),
            SharedAccount::new(AccountState::new(config.starting_balance, t0())),
        )
    }

    fn bar(i: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::M15,
            open_time: t0() + Duration::minutes(15 * i),
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    fn far_future() -> DateTime<Utc> {
        t0() + Duration::days(365)
    }

    #[test]
    fn test_invalid_candle_is_skipped() {
        let config = config();
        let exec = exec(&config);
        let mut engine = SymbolEngine::new("BTCUSDT", config).unwrap();

        let events = engine.on_candle(bar(0, 100.0, 99.0, 101.0, 100.0), &exec, far_future());
        assert!(matches!(events[0], EngineEvent::CandleSkipped { .. }));
        assert!(engine.frame(Timeframe::M15).unwrap().series().is_empty());

        let mut h1 = bar(0, 100.0, 101.0, 99.0, 100.0);
        h1.timeframe = Timeframe::H1;
        let events = engine.on_candle(h1, &exec, far_future());
        assert!(matches!(events[0], EngineEvent::CandleSkipped { .. }));
    }

    #[test]
    fn test_emergency_stop_flattens_restored_position() {
        let config = config();
        let exec = exec(&config);
        let mut engine = SymbolEngine::new("BTCUSDT", config).unwrap();

        let position = Position {
            id: uuid::Uuid::new_v4(),
            signal_id: uuid::Uuid::new_v4(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            size: 1.0,
            entry_price: 100.0,
            stop_loss: 98.0,
            take_profit: 104.0,
            risk_amount: 2.0,
            status: PositionStatus::Open,
            created_at: t0(),
            expires_at: t0() + Duration::hours(1),
            entry_time: Some(t0()),
            exit_price: None,
            exit_time: None,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
        };
        engine.restore_position(position.clone());
        exec.reconcile(&[position], t0()).unwrap();

        engine.on_tick(
            PriceTick {
                symbol: "BTCUSDT".to_string(),
                price: 101.0,
                time: t0() + Duration::minutes(1),
            },
            &exec,
        );

        let events = engine.set_halted(true, t0() + Duration::minutes(2), &exec);
        let closed: Vec<_> = events.iter().filter_map(|e| e.position()).collect();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].status, PositionStatus::ClosedManual);
        assert_eq!(closed[0].realized_pnl, 1.0);
        assert!(engine.positions().is_empty());

        let account = exec.account().snapshot().unwrap();
        assert_eq!(account.open_positions, 0);
        assert_eq!(account.balance, config_balance() + 1.0);

        // Idempotent
        assert!(engine.set_halted(true, t0() + Duration::minutes(3), &exec).is_empty());
    }

    fn config_balance() -> f64 {
        EngineConfig::default().starting_balance
    }

    #[test]
    fn test_no_trend_means_no_signal() {
        let config = config();
        let exec = exec(&config);
        let mut engine = SymbolEngine::new("BTCUSDT", config).unwrap();
        for i in 0..30 {
            let events = engine.on_candle(bar(i, 100.0, 100.5, 99.5, 100.0), &exec, far_future());
            assert!(events.iter().all(|e| e.signal().is_none()));
        }
        assert_eq!(engine.bias().direction, Bias::Neutral);
    }
}
