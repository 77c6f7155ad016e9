//! Per-(symbol, timeframe) analysis state
//!
//! One appended candle runs, in order: structure, order blocks, fair value
//! gaps, liquidity, then the timeframe bias reading, then pruning. The
//! reading is taken before pruning so zones touched or filled by this candle
//! still count as confluence.
//!
//! Revised or backfilled candles rebuild the detectors from the window with
//! no events emitted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bias::{timeframe_bias, BiasState, FrameReading, ZonePresence};
use super::fvg::{FairValueGap, FvgDetector};
use super::liquidity::{LiquidityDetector, LiquidityPool, LiquiditySweep, PoolKind};
use super::order_block::{OrderBlock, OrderBlockDetector};
use super::series::{CandleSeries, Upsert};
use super::structure::{MarketStructure, StructureEvent, SwingPoint};
use crate::config::{BiasConfig, EngineConfig};
use crate::types::{Candle, Direction, Timeframe};

/// Any zone object a detector can create or retire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "zone", rename_all = "snake_case")]
pub enum Zone {
    OrderBlock(OrderBlock),
    FairValueGap(FairValueGap),
    LiquidityPool(LiquidityPool),
}

#[derive(Debug, Clone)]
pub struct FrameUpdate {
    pub swings: Vec<SwingPoint>,
    pub structure: Option<StructureEvent>,
    pub created: Vec<Zone>,
    pub retired: Vec<Zone>,
    pub touched_order_blocks: Vec<OrderBlock>,
    pub touched_fvgs: Vec<FairValueGap>,
    pub sweeps: Vec<LiquiditySweep>,
    pub bias: BiasState,
}

/// Outcome of ingesting one candle
#[derive(Debug, Clone)]
pub enum Ingest {
    /// New bar processed
    Updated(Box<FrameUpdate>),
    /// Late or revised bar; detector state was rebuilt quietly
    Rebuilt,
    /// Nothing changed
    Ignored(Upsert),
}

#[derive(Debug, Clone)]
struct Detectors {
    timeframe: Timeframe,
    recency: usize,
    weights: BiasConfig,
    structure: MarketStructure,
    order_blocks: OrderBlockDetector,
    fvgs: FvgDetector,
    liquidity: LiquidityDetector,
    last_seq: Option<u64>,
    reading: Option<FrameReading>,
    bias: Option<BiasState>,
}

impl Detectors {
    fn new(symbol: &str, timeframe: Timeframe, config: &EngineConfig) -> Self {
        Self {
            timeframe,
            recency: config.structure.recency_bars,
            weights: config.bias.clone(),
            structure: MarketStructure::new(config.structure.swing_strength),
            order_blocks: OrderBlockDetector::new(config.displacement.clone(), config.order_block_max_age),
            fvgs: FvgDetector::new(
                config.fvg_min_size_pct.get(symbol),
                config.fvg_fill_threshold,
                config.fvg_max_age,
            ),
            liquidity: LiquidityDetector::new(config.liquidity_tolerance_pct, config.liquidity_max_age),
            last_seq: None,
            reading: None,
            bias: None,
        }
    }

    fn step(&mut self, window: &[Candle], seq: u64) -> Option<FrameUpdate> {
        let current = window.last()?;
        let now = current.close_time();

        let structure = self.structure.update(window, seq);
        let obs = self.order_blocks.update(window);
        let fvgs = self.fvgs.update(window);
        let liquidity = self.liquidity.update(current, &structure.swings, seq);
        self.last_seq = Some(seq);

        let reading = self.read(now);
        let bias = timeframe_bias(&reading, &self.weights);
        self.reading = Some(reading);
        self.bias = Some(bias.clone());

        let mut created: Vec<Zone> = Vec::new();
        created.extend(obs.created.into_iter().map(Zone::OrderBlock));
        created.extend(fvgs.created.into_iter().map(Zone::FairValueGap));
        created.extend(liquidity.created.into_iter().map(Zone::LiquidityPool));

        let mut retired: Vec<Zone> = Vec::new();
        retired.extend(self.order_blocks.prune(now).into_iter().map(Zone::OrderBlock));
        retired.extend(self.fvgs.prune(now).into_iter().map(Zone::FairValueGap));
        retired.extend(self.liquidity.prune(now).into_iter().map(Zone::LiquidityPool));

        Some(FrameUpdate {
            swings: structure.swings,
            structure: structure.event,
            created,
            retired,
            touched_order_blocks: obs.touched,
            touched_fvgs: fvgs.touched,
            sweeps: liquidity.swept,
            bias,
        })
    }

    /// Reading over every zone not yet pruned
    fn read(&self, at: DateTime<Utc>) -> FrameReading {
        let seq = self.last_seq.unwrap_or(0);
        let mut zones = ZonePresence::default();
        for block in self.order_blocks.blocks() {
            match block.direction {
                Direction::Bullish => zones.bullish_order_block = true,
                Direction::Bearish => zones.bearish_order_block = true,
            }
        }
        for gap in self.fvgs.gaps() {
            match gap.direction {
                Direction::Bullish => zones.bullish_fvg = true,
                Direction::Bearish => zones.bearish_fvg = true,
            }
        }
        for pool in self.liquidity.pools().iter().filter(|p| !p.swept && !p.broken) {
            match pool.kind {
                PoolKind::EqualHighs => zones.equal_highs = true,
                PoolKind::EqualLows => zones.equal_lows = true,
            }
        }

        FrameReading {
            timeframe: self.timeframe,
            trend: self.structure.trend(),
            recent_break: self.structure.recent_break(seq, self.recency).map(|e| e.direction),
            recent_sweep: self.liquidity.recent_sweep(seq, self.recency).map(|s| s.direction),
            zones,
            at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrameState {
    symbol: String,
    series: CandleSeries,
    detectors: Detectors,
    config: EngineConfig,
    next_seq: u64,
}

impl FrameState {
    pub fn new(symbol: &str, timeframe: Timeframe, config: &EngineConfig) -> Self {
        Self {
            symbol: symbol.to_string(),
            series: CandleSeries::new(symbol, timeframe, config.window_size),
            detectors: Detectors::new(symbol, timeframe, config),
            config: config.clone(),
            next_seq: 0,
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.detectors.timeframe
    }

    pub fn series(&self) -> &CandleSeries {
        &self.series
    }

    pub fn reading(&self) -> Option<&FrameReading> {
        self.detectors.reading.as_ref()
    }

    pub fn bias(&self) -> Option<&BiasState> {
        self.detectors.bias.as_ref()
    }

    pub fn trend(&self) -> Option<Direction> {
        self.detectors.structure.trend()
    }

    pub fn recent_structure(&self) -> Option<&StructureEvent> {
        let seq = self.detectors.last_seq?;
        self.detectors.structure.recent_break(seq, self.detectors.recency)
    }

    pub fn recent_sweep(&self) -> Option<&LiquiditySweep> {
        let seq = self.detectors.last_seq?;
        self.detectors.liquidity.recent_sweep(seq, self.detectors.recency)
    }

    pub fn order_blocks(&self) -> &[OrderBlock] {
        self.detectors.order_blocks.blocks()
    }

    pub fn fair_value_gaps(&self) -> &[FairValueGap] {
        self.detectors.fvgs.gaps()
    }

    pub fn liquidity_pools(&self) -> &[LiquidityPool] {
        self.detectors.liquidity.pools()
    }

    pub fn ingest(&mut self, candle: Candle) -> Ingest {
        let outcome = self.series.upsert(candle);
        match outcome {
            Upsert::Appended => {
                let seq = self.next_seq;
                self.next_seq += 1;
                match self.detectors.step(self.series.as_slice(), seq) {
                    Some(update) => Ingest::Updated(Box::new(update)),
                    None => Ingest::Ignored(outcome),
                }
            }
            Upsert::Replaced | Upsert::Backfilled => {
                self.rebuild();
                Ingest::Rebuilt
            }
            Upsert::Duplicate | Upsert::Stale => Ingest::Ignored(outcome),
        }
    }

    /// Replay the whole window through fresh detectors
    fn rebuild(&mut self) {
        let candles = self.series.as_slice().to_vec();
        self.detectors = Detectors::new(&self.symbol, self.detectors.timeframe, &self.config);
        for n in 1..=candles.len() {
            self.detectors.step(&candles[..n], n as u64 - 1);
        }
        self.next_seq = candles.len() as u64;
        tracing::debug!(
            "REBUILD: {} {} from {} candles",
            self.symbol,
            self.detectors.timeframe,
            candles.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn bar(i: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            symbol: "X".to_string(),
            timeframe: Timeframe::M15,
            open_time: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap() + Duration::minutes(15 * i),
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    fn zigzag() -> Vec<Candle> {
        let mut out = Vec::new();
        let mut p = 100.0;
        let mut i = 0;
        for _ in 0..4 {
            for _ in 0..3 {
                out.push(bar(i, p, p + 1.2, p - 0.1, p + 1.0));
                p += 1.0;
                i += 1;
            }
            for _ in 0..2 {
                out.push(bar(i, p, p + 0.1, p - 0.8, p - 0.6));
                p -= 0.6;
                i += 1;
            }
        }
        out
    }

    #[test]
    fn test_uptrend_reading() {
        let config = EngineConfig::default();
        let mut frame = FrameState::new("X", Timeframe::M15, &config);
        let mut breaks = 0;
        for candle in zigzag() {
            if let Ingest::Updated(update) = frame.ingest(candle) {
                if update.structure.is_some() {
                    breaks += 1;
                }
            }
        }
        assert!(breaks >= 2);
        assert_eq!(frame.trend(), Some(Direction::Bullish));
        let reading = frame.reading().unwrap();
        assert_eq!(reading.recent_break, Some(Direction::Bullish));
        assert_eq!(frame.bias().unwrap().direction, crate::types::Bias::Bullish);
    }

    #[test]
    fn test_backfill_rebuilds_same_state() {
        let config = EngineConfig::default();
        let candles = zigzag();

        let mut ordered = FrameState::new("X", Timeframe::M15, &config);
        for c in candles.iter().cloned() {
            ordered.ingest(c);
        }

        // Deliver bar 7 late
        let mut late = FrameState::new("X", Timeframe::M15, &config);
        for (i, c) in candles.iter().cloned().enumerate() {
            if i != 7 {
                late.ingest(c);
            }
        }
        assert!(matches!(late.ingest(candles[7].clone()), Ingest::Rebuilt));
        assert!(matches!(late.ingest(candles[7].clone()), Ingest::Ignored(Upsert::Duplicate)));

        assert_eq!(late.trend(), ordered.trend());
        assert_eq!(
            late.reading().map(|r| (r.trend, r.recent_break, r.zones)),
            ordered.reading().map(|r| (r.trend, r.recent_break, r.zones))
        );
        assert_eq!(late.series().len(), ordered.series().len());
    }
}
