//! Order Block Detector
//!
//! A displacement candle has a range of at least `atr_multiple` times the
//! ATR of the bars before it. The order block is the last opposite-colored
//! candle within `lookback` bars before the displacement, zone [low, high].
//!
//! A later close inside the zone mitigates it (that close is the touch an
//! entry can use). A close beyond the far side invalidates it untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::indicators::atr;
use crate::config::DisplacementConfig;
use crate::types::{Candle, Direction};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBlock {
    pub id: Uuid,
    pub direction: Direction,
    pub low: f64,
    pub high: f64,
    /// Open time of the order block candle
    pub origin_time: DateTime<Utc>,
    /// Open time of the displacement candle
    pub displacement_time: DateTime<Utc>,
    pub mitigated: bool,
    pub invalidated: bool,
}

impl OrderBlock {
    pub fn contains(&self, price: f64) -> bool {
        price >= self.low && price <= self.high
    }

    pub fn is_expired(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        age_exceeds(self.origin_time, now, max_age)
    }

    pub fn is_retired(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.mitigated || self.invalidated || self.is_expired(now, max_age)
    }
}

pub(crate) fn age_exceeds(origin: DateTime<Utc>, now: DateTime<Utc>, max_age: Duration) -> bool {
    match chrono::Duration::from_std(max_age) {
        Ok(max) => now - origin > max,
        Err(_) => false,
    }
}

/// Changes caused by one candle
#[derive(Debug, Clone, Default)]
pub struct OrderBlockUpdate {
    pub created: Vec<OrderBlock>,
    /// Blocks a close landed inside this candle
    pub touched: Vec<OrderBlock>,
}

#[derive(Debug, Clone)]
pub struct OrderBlockDetector {
    config: DisplacementConfig,
    max_age: Duration,
    blocks: Vec<OrderBlock>,
}

impl OrderBlockDetector {
    pub fn new(config: DisplacementConfig, max_age: Duration) -> Self {
        Self {
            config,
            max_age,
            blocks: Vec::new(),
        }
    }

    /// Blocks not yet pruned, including ones mitigated this cycle
    pub fn blocks(&self) -> &[OrderBlock] {
        &self.blocks
    }

    /// Unmitigated blocks within max age
    pub fn active(&self, now: DateTime<Utc>) -> impl Iterator<Item = &OrderBlock> {
        let max_age = self.max_age;
        self.blocks.iter().filter(move |b| !b.is_retired(now, max_age))
    }

    pub fn update(&mut self, window: &[Candle]) -> OrderBlockUpdate {
        let mut update = OrderBlockUpdate::default();
        let Some(current) = window.last() else {
            return update;
        };

        // Existing blocks first; a block never reacts to its own displacement
        for block in self.blocks.iter_mut().filter(|b| !b.mitigated && !b.invalidated) {
            if block.contains(current.close) {
                block.mitigated = true;
                update.touched.push(block.clone());
            } else if (block.direction == Direction::Bullish && current.close < block.low)
                || (block.direction == Direction::Bearish && current.close > block.high)
            {
                block.invalidated = true;
            }
        }

        if let Some(block) = self.detect(window) {
            update.created.push(block.clone());
            self.blocks.push(block);
        }

        update
    }

    fn detect(&self, window: &[Candle]) -> Option<OrderBlock> {
        let n = window.len();
        let current = window.last()?;
        let prior = &window[..n - 1];
        let atr = atr(prior, self.config.atr_period)?;

        if atr <= 0.0 || current.range() < self.config.atr_multiple * atr {
            return None;
        }
        let direction = if current.is_bullish() {
            Direction::Bullish
        } else if current.is_bearish() {
            Direction::Bearish
        } else {
            return None;
        };

        let origin = prior
            .iter()
            .rev()
            .take(self.config.lookback)
            .find(|c| match direction {
                Direction::Bullish => c.is_bearish(),
                Direction::Bearish => c.is_bullish(),
            })?;

        if self
            .blocks
            .iter()
            .any(|b| b.origin_time == origin.open_time && b.direction == direction)
        {
            return None;
        }

        tracing::debug!(
            "ORDER BLOCK: {} {} [{:.2}, {:.2}] | range {:.2} vs ATR {:.2}",
            current.symbol,
            direction,
            origin.low,
            origin.high,
            current.range(),
            atr
        );

        Some(OrderBlock {
            id: Uuid::new_v4(),
            direction,
            low: origin.low,
            high: origin.high,
            origin_time: origin.open_time,
            displacement_time: current.open_time,
            mitigated: false,
            invalidated: false,
        })
    }

    /// Drop mitigated, invalidated and expired blocks. Idempotent.
    pub fn prune(&mut self, now: DateTime<Utc>) -> Vec<OrderBlock> {
        let max_age = self.max_age;
        let (retired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.blocks)
            .into_iter()
            .partition(|b| b.is_retired(now, max_age));
        self.blocks = kept;
        retired
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;
    use chrono::TimeZone;

    fn series(ohlc: &[(f64, f64, f64, f64)]) -> Vec<Candle> {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        ohlc.iter()
            .enumerate()
            .map(|(i, &(open, high, low, close))| Candle {
                symbol: "X".to_string(),
                timeframe: Timeframe::M15,
                open_time: t0 + chrono::Duration::minutes(15 * i as i64),
                open,
                high,
                low,
                close,
                volume: 1.0,
            })
            .collect()
    }

    fn detector() -> OrderBlockDetector {
        OrderBlockDetector::new(
            DisplacementConfig {
                atr_period: 3,
                atr_multiple: 2.0,
                lookback: 3,
            },
            Duration::from_secs(3_600),
        )
    }

    fn feed(det: &mut OrderBlockDetector, candles: &[Candle]) -> Vec<OrderBlockUpdate> {
        (1..=candles.len()).map(|n| det.update(&candles[..n])).collect()
    }

    #[test]
    fn test_bullish_block_from_displacement() {
        let candles = series(&[
            (100.0, 100.5, 99.5, 100.2),
            (100.2, 100.7, 99.8, 100.4),
            (100.4, 100.9, 100.0, 100.6),
            (100.6, 100.8, 99.9, 100.1),   // last bearish candle
            (100.1, 103.5, 100.0, 103.4),  // displacement: range 3.5 vs ATR 1
        ]);
        let mut det = detector();
        let updates = feed(&mut det, &candles);
        let created = &updates[4].created;
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].direction, Direction::Bullish);
        assert_eq!((created[0].low, created[0].high), (99.9, 100.8));
    }

    #[test]
    fn test_mitigation_and_prune_idempotent() {
        let candles = series(&[
            (100.0, 100.5, 99.5, 100.2),
            (100.2, 100.7, 99.8, 100.4),
            (100.4, 100.9, 100.0, 100.6),
            (100.6, 100.8, 99.9, 100.1),
            (100.1, 103.5, 100.0, 103.4),
            (103.4, 103.6, 100.3, 100.5),  // close back inside [99.9, 100.8]
        ]);
        let mut det = detector();
        let updates = feed(&mut det, &candles);
        assert_eq!(updates[5].touched.len(), 1);
        assert!(det.blocks().iter().any(|b| b.mitigated));

        let now = candles[5].close_time();
        let retired = det.prune(now);
        assert!(retired.iter().any(|b| b.direction == Direction::Bullish));
        assert!(det.blocks().iter().all(|b| !b.mitigated));
        assert!(det.prune(now).is_empty());
    }

    #[test]
    fn test_expired_block_excluded() {
        let candles = series(&[
            (100.0, 100.5, 99.5, 100.2),
            (100.2, 100.7, 99.8, 100.4),
            (100.4, 100.9, 100.0, 100.6),
            (100.6, 100.8, 99.9, 100.1),
            (100.1, 103.5, 100.0, 103.4),
        ]);
        let mut det = detector();
        feed(&mut det, &candles);
        let later = candles[3].open_time + chrono::Duration::hours(2);
        assert_eq!(det.active(later).count(), 0);
        assert_eq!(det.prune(later).len(), 1);
        assert!(det.blocks().is_empty());
    }
}
