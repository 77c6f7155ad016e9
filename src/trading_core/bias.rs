//! Directional Bias Engine
//!
//! Pure functions over per-timeframe readings. Each timeframe gets a signed
//! score from four components (trend, recent structure break, zone
//! confluence, recent liquidity sweep), weighted by `BiasConfig`. The symbol
//! direction is the highest timeframe's direction; NEUTRAL there blocks every
//! entry on the symbol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BiasConfig;
use crate::types::{Bias, Direction, Timeframe};

/// Zones present on a timeframe this cycle (before pruning)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZonePresence {
    pub bullish_order_block: bool,
    pub bearish_order_block: bool,
    pub bullish_fvg: bool,
    pub bearish_fvg: bool,
    /// Resting buy-side liquidity (upside target)
    pub equal_highs: bool,
    /// Resting sell-side liquidity (downside target)
    pub equal_lows: bool,
}

impl ZonePresence {
    /// Confirmations (0..=3) aligned with `direction`
    pub fn count(&self, direction: Direction) -> usize {
        let flags = match direction {
            Direction::Bullish => [self.bullish_order_block, self.bullish_fvg, self.equal_highs],
            Direction::Bearish => [self.bearish_order_block, self.bearish_fvg, self.equal_lows],
        };
        flags.iter().filter(|f| **f).count()
    }
}

/// Everything bias needs to know about one timeframe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameReading {
    pub timeframe: Timeframe,
    pub trend: Option<Direction>,
    pub recent_break: Option<Direction>,
    pub recent_sweep: Option<Direction>,
    pub zones: ZonePresence,
    pub at: DateTime<Utc>,
}

/// Signed components in [-1, 1]; positive is bullish
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BiasComponents {
    pub trend: f64,
    pub structure: f64,
    pub confluence: f64,
    pub liquidity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasState {
    pub timeframe: Timeframe,
    pub direction: Bias,
    /// |score| in [0, 1]
    pub strength: f64,
    pub components: BiasComponents,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolBias {
    pub direction: Bias,
    /// Timeframe the direction was taken from
    pub anchor: Option<Timeframe>,
    pub strength: f64,
}

impl SymbolBias {
    pub fn neutral() -> Self {
        Self {
            direction: Bias::Neutral,
            anchor: None,
            strength: 0.0,
        }
    }
}

fn signed(direction: Option<Direction>) -> f64 {
    direction.map(|d| d.sign()).unwrap_or(0.0)
}

fn weighted(weights: &BiasConfig, c: &BiasComponents) -> f64 {
    let total = weights.total_weight();
    if total <= 0.0 {
        return 0.0;
    }
    let raw = weights.htf_trend_weight * c.trend
        + weights.structure_weight * c.structure
        + weights.confluence_weight * c.confluence
        + weights.liquidity_weight * c.liquidity;
    (raw / total).clamp(-1.0, 1.0)
}

pub fn timeframe_bias(reading: &FrameReading, weights: &BiasConfig) -> BiasState {
    let bull = reading.zones.count(Direction::Bullish) as f64;
    let bear = reading.zones.count(Direction::Bearish) as f64;
    let components = BiasComponents {
        trend: signed(reading.trend),
        structure: signed(reading.recent_break),
        confluence: ((bull - bear) / 3.0).clamp(-1.0, 1.0),
        liquidity: signed(reading.recent_sweep),
    };

    let score = weighted(weights, &components);
    let direction = if score.abs() < weights.neutral_band {
        Bias::Neutral
    } else if score > 0.0 {
        Bias::Bullish
    } else {
        Bias::Bearish
    };

    BiasState {
        timeframe: reading.timeframe,
        direction,
        strength: score.abs(),
        components,
        last_updated: reading.at,
    }
}

/// Top-down: the anchor (highest) timeframe decides. Missing anchor state
/// is NEUTRAL.
pub fn symbol_bias(states: &[BiasState], anchor: Timeframe) -> SymbolBias {
    match states.iter().find(|s| s.timeframe == anchor) {
        Some(state) => SymbolBias {
            direction: state.direction,
            anchor: Some(anchor),
            strength: state.strength,
        },
        None => SymbolBias::neutral(),
    }
}

/// Confidence in [0, 1] for an entry in `direction`.
///
/// Trend is the share of context timeframes trending that way (the entry
/// timeframe alone when it is the only one); structure, confluence and
/// liquidity come from the entry timeframe.
pub fn confidence(
    direction: Direction,
    entry: &FrameReading,
    context: &[&FrameReading],
    weights: &BiasConfig,
) -> f64 {
    let total = weights.total_weight();
    if total <= 0.0 {
        return 0.0;
    }

    let frames: Vec<&FrameReading> = if context.is_empty() {
        vec![entry]
    } else {
        context.to_vec()
    };
    let agreeing = frames.iter().filter(|r| r.trend == Some(direction)).count();
    let trend = agreeing as f64 / frames.len() as f64;
    let structure = if entry.recent_break == Some(direction) { 1.0 } else { 0.0 };
    let confluence = entry.zones.count(direction) as f64 / 3.0;
    let liquidity = if entry.recent_sweep == Some(direction) { 1.0 } else { 0.0 };

    let score = weights.htf_trend_weight * trend
        + weights.structure_weight * structure
        + weights.confluence_weight * confluence
        + weights.liquidity_weight * liquidity;

    (score / total).clamp(0.0, 1.0)
}
