//! Engine configuration
//!
//! Loaded from JSON; every field has a default so a partial file is enough.
//! `validate` runs before anything else starts and fails closed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::EngineError;
use crate::types::Timeframe;

/// A value with per-symbol overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerSymbol<T> {
    pub default: T,
    #[serde(default)]
    pub overrides: HashMap<String, T>,
}

impl<T: Copy> PerSymbol<T> {
    pub fn uniform(default: T) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with(mut self, symbol: &str, value: T) -> Self {
        self.overrides.insert(symbol.to_string(), value);
        self
    }

    pub fn get(&self, symbol: &str) -> T {
        self.overrides.get(symbol).copied().unwrap_or(self.default)
    }

    fn values(&self) -> impl Iterator<Item = T> + '_ {
        std::iter::once(self.default).chain(self.overrides.values().copied())
    }
}

/// Swing detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StructureConfig {
    /// Bars on each side a swing extreme must exceed (K)
    pub swing_strength: usize,
    /// A break counts as "recent" for bias within this many bars
    pub recency_bars: usize,
}

impl Default for StructureConfig {
    fn default() -> Self {
        Self {
            swing_strength: 2,
            recency_bars: 20,
        }
    }
}

/// Displacement settings for order block detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplacementConfig {
    /// ATR lookback in bars
    pub atr_period: usize,
    /// Candle range must reach this multiple of ATR
    pub atr_multiple: f64,
    /// Bars searched backwards for the last opposite candle
    pub lookback: usize,
}

impl Default for DisplacementConfig {
    fn default() -> Self {
        Self {
            atr_period: 14,
            atr_multiple: 2.0,
            lookback: 3,
        }
    }
}

/// Confluence weighting. Tunable; the defaults are a starting point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BiasConfig {
    pub htf_trend_weight: f64,
    pub structure_weight: f64,
    pub confluence_weight: f64,
    pub liquidity_weight: f64,
    /// |score| below this is NEUTRAL
    pub neutral_band: f64,
}

impl Default for BiasConfig {
    fn default() -> Self {
        Self {
            htf_trend_weight: 0.40,
            structure_weight: 0.25,
            confluence_weight: 0.20,
            liquidity_weight: 0.15,
            neutral_band: 0.2,
        }
    }
}

impl BiasConfig {
    pub fn total_weight(&self) -> f64 {
        self.htf_trend_weight + self.structure_weight + self.confluence_weight + self.liquidity_weight
    }
}

/// Confidence at or above `min_confidence` earns `reward_ratio` R
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardTier {
    pub min_confidence: f64,
    pub reward_ratio: f64,
}

/// Durable write policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Attempts per record before spooling
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// JSONL queue for records the store did not accept
    pub spool_path: Option<PathBuf>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            spool_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Account balance when no persisted state exists
    pub starting_balance: f64,

    /// Fraction of balance risked per trade
    pub risk_per_trade: f64,

    /// Maximum PENDING + OPEN positions across all symbols
    pub max_concurrent_positions: usize,

    /// Sum of open risk as a fraction of balance
    pub max_portfolio_risk: f64,

    /// Realized daily loss (fraction of day-start balance) that halts new signals
    pub max_daily_loss: f64,

    /// Minimum confidence for a candidate to become a signal
    pub confidence_threshold: f64,

    /// Minimum spacing between signals on the same symbol
    pub signal_cooldown_seconds: u64,

    /// Unfilled signals expire after this long
    pub signal_ttl_seconds: u64,

    #[serde(with = "duration_secs")]
    pub order_block_max_age: Duration,

    #[serde(with = "duration_secs")]
    pub fvg_max_age: Duration,

    #[serde(with = "duration_secs")]
    pub liquidity_max_age: Duration,

    /// Minimum gap size as percent of price (0.1 = 0.1%)
    pub fvg_min_size_pct: PerSymbol<f64>,

    /// Fill ratio at which a gap is retired
    pub fvg_fill_threshold: f64,

    /// Equal highs/lows band as percent of price
    pub liquidity_tolerance_pct: f64,

    /// Analysed timeframes; the smallest is the entry timeframe
    pub timeframes: Vec<Timeframe>,

    pub structure: StructureConfig,
    pub displacement: DisplacementConfig,
    pub bias: BiasConfig,
    pub reward_tiers: Vec<RewardTier>,

    /// Buffer beyond the invalidation point, percent of entry
    pub stop_buffer_pct: f64,

    /// Stop distance floor, percent of entry
    pub min_stop_distance_pct: f64,

    /// Exchange quantity increment per symbol
    pub qty_step: PerSymbol<f64>,

    /// Candles retained per (symbol, timeframe)
    pub window_size: usize,

    /// Also check stop/target against entry-timeframe candles, not only ticks
    pub evaluate_exits_on_candles: bool,

    pub persistence: PersistenceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            starting_balance: 10_000.0,
            risk_per_trade: 0.01,         // 1% per trade
            max_concurrent_positions: 3,
            max_portfolio_risk: 0.05,     // 5% total open risk
            max_daily_loss: 0.03,
            confidence_threshold: 0.6,
            signal_cooldown_seconds: 3_600,
            signal_ttl_seconds: 3_600,
            order_block_max_age: Duration::from_secs(3 * 86_400),
            fvg_max_age: Duration::from_secs(2 * 86_400),
            liquidity_max_age: Duration::from_secs(5 * 86_400),
            fvg_min_size_pct: PerSymbol::uniform(0.1),
            fvg_fill_threshold: 0.75,
            liquidity_tolerance_pct: 0.1,
            timeframes: vec![Timeframe::H4, Timeframe::H1, Timeframe::M15],
            structure: StructureConfig::default(),
            displacement: DisplacementConfig::default(),
            bias: BiasConfig::default(),
            reward_tiers: vec![
                RewardTier { min_confidence: 0.0, reward_ratio: 2.0 },
                RewardTier { min_confidence: 0.7, reward_ratio: 3.0 },
                RewardTier { min_confidence: 0.8, reward_ratio: 4.0 },
                RewardTier { min_confidence: 0.9, reward_ratio: 5.0 },
            ],
            stop_buffer_pct: 0.05,
            min_stop_distance_pct: 0.1,
            qty_step: PerSymbol::uniform(0.001),
            window_size: 300,
            evaluate_exits_on_candles: true,
            persistence: PersistenceConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load and validate a JSON config file
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: EngineConfig = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Configuration(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Entry timeframe (smallest configured)
    pub fn entry_timeframe(&self) -> Option<Timeframe> {
        self.timeframes.iter().min().copied()
    }

    /// Anchor timeframe (largest configured)
    pub fn anchor_timeframe(&self) -> Option<Timeframe> {
        self.timeframes.iter().max().copied()
    }

    pub fn cooldown(&self) -> chrono::Duration {
        signal_window(self.signal_cooldown_seconds)
    }

    pub fn signal_ttl(&self) -> chrono::Duration {
        signal_window(self.signal_ttl_seconds)
    }

    /// Reward multiple for a confidence, from the highest tier reached
    pub fn reward_ratio(&self, confidence: f64) -> f64 {
        self.reward_tiers
            .iter()
            .filter(|t| confidence >= t.min_confidence)
            .max_by(|a, b| a.min_confidence.total_cmp(&b.min_confidence))
            .map(|t| t.reward_ratio)
            .unwrap_or_else(|| self.lowest_reward_ratio())
    }

    fn lowest_reward_ratio(&self) -> f64 {
        self.reward_tiers
            .iter()
            .map(|t| t.reward_ratio)
            .fold(f64::INFINITY, f64::min)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        fn fail(msg: impl Into<String>) -> Result<(), EngineError> {
            Err(EngineError::Configuration(msg.into()))
        }

        if !(self.starting_balance.is_finite() && self.starting_balance > 0.0) {
            return fail(format!("starting_balance must be > 0 (got {})", self.starting_balance));
        }
        if !(self.risk_per_trade > 0.0 && self.risk_per_trade <= 0.1) {
            return fail(format!("risk_per_trade must be in (0, 0.1] (got {})", self.risk_per_trade));
        }
        if self.max_concurrent_positions == 0 {
            return fail("max_concurrent_positions must be at least 1");
        }
        if !(self.max_portfolio_risk >= self.risk_per_trade && self.max_portfolio_risk <= 1.0) {
            return fail(format!(
                "max_portfolio_risk must be in [risk_per_trade, 1] (got {})",
                self.max_portfolio_risk
            ));
        }
        if !(self.max_daily_loss > 0.0 && self.max_daily_loss <= 1.0) {
            return fail(format!("max_daily_loss must be in (0, 1] (got {})", self.max_daily_loss));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return fail(format!(
                "confidence_threshold must be in [0, 1] (got {})",
                self.confidence_threshold
            ));
        }
        if self.signal_ttl_seconds == 0 || self.signal_ttl_seconds > MAX_SIGNAL_WINDOW_SECONDS {
            return fail(format!(
                "signal_ttl_seconds must be in (0, {}] (got {})",
                MAX_SIGNAL_WINDOW_SECONDS, self.signal_ttl_seconds
            ));
        }
        if self.signal_cooldown_seconds > MAX_SIGNAL_WINDOW_SECONDS {
            return fail(format!(
                "signal_cooldown_seconds must be at most {} (got {})",
                MAX_SIGNAL_WINDOW_SECONDS, self.signal_cooldown_seconds
            ));
        }
        if self.order_block_max_age.is_zero() || self.fvg_max_age.is_zero() || self.liquidity_max_age.is_zero() {
            return fail("zone max ages must be > 0");
        }
        if self.fvg_min_size_pct.values().any(|v| !(v > 0.0 && v.is_finite())) {
            return fail("fvg_min_size_pct must be > 0 for every symbol");
        }
        if !(self.fvg_fill_threshold > 0.0 && self.fvg_fill_threshold <= 1.0) {
            return fail(format!(
                "fvg_fill_threshold must be in (0, 1] (got {})",
                self.fvg_fill_threshold
            ));
        }
        if !(self.liquidity_tolerance_pct >= 0.0 && self.liquidity_tolerance_pct.is_finite()) {
            return fail("liquidity_tolerance_pct must be >= 0");
        }
        if self.timeframes.is_empty() {
            return fail("at least one timeframe is required");
        }
        let mut seen = self.timeframes.clone();
        seen.sort();
        seen.dedup();
        if seen.len() != self.timeframes.len() {
            return fail("timeframes must not repeat");
        }
        if self.structure.swing_strength == 0 {
            return fail("structure.swing_strength must be at least 1");
        }
        if self.displacement.atr_period == 0 || self.displacement.lookback == 0 {
            return fail("displacement.atr_period and displacement.lookback must be at least 1");
        }
        if self.displacement.atr_multiple <= 0.0 {
            return fail("displacement.atr_multiple must be > 0");
        }
        let weights = [
            self.bias.htf_trend_weight,
            self.bias.structure_weight,
            self.bias.confluence_weight,
            self.bias.liquidity_weight,
        ];
        if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) || self.bias.total_weight() <= 0.0 {
            return fail("bias weights must be non-negative and sum to > 0");
        }
        if !(0.0..1.0).contains(&self.bias.neutral_band) {
            return fail("bias.neutral_band must be in [0, 1)");
        }
        if self.reward_tiers.is_empty() || self.reward_tiers.iter().any(|t| t.reward_ratio <= 0.0) {
            return fail("reward_tiers must be non-empty with positive ratios");
        }
        if self.stop_buffer_pct < 0.0 || self.min_stop_distance_pct <= 0.0 {
            return fail("stop_buffer_pct must be >= 0 and min_stop_distance_pct > 0");
        }
        if self.qty_step.values().any(|v| !(v > 0.0 && v.is_finite())) {
            return fail("qty_step must be > 0 for every symbol");
        }
        let min_window = (2 * self.structure.swing_strength + 1)
            .max(self.displacement.atr_period + 2)
            .max(3);
        if self.window_size < min_window {
            return fail(format!("window_size must be at least {}", min_window));
        }
        if self.persistence.max_attempts == 0 {
            return fail("persistence.max_attempts must be at least 1");
        }
        Ok(())
    }
}

/// `std::time::Duration` as whole seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Upper bound for signal TTL and cooldown: 30 days
pub const MAX_SIGNAL_WINDOW_SECONDS: u64 = 30 * 24 * 3_600;

fn signal_window(seconds: u64) -> chrono::Duration {
    let seconds = i64::try_from(seconds.min(MAX_SIGNAL_WINDOW_SECONDS)).unwrap_or(i64::MAX);
    chrono::Duration::seconds(seconds)
}
