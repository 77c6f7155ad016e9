//! Fair Value Gap Detector
//!
//! Three candles c1, c2, c3: bullish when c1.high < c3.low, bearish when
//! c1.low > c3.high. The gap must be at least `min_size_pct` percent of the
//! middle close. Fill ratio is the deepest revisit seen so far.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::order_block::age_exceeds;
use crate::types::{Candle, Direction};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FairValueGap {
    pub id: Uuid,
    pub direction: Direction,
    pub low: f64,
    pub high: f64,
    /// Open time of the middle candle
    pub created_at: DateTime<Utc>,
    /// 0 = untouched, 1 = fully revisited
    pub fill_ratio: f64,
    pub filled: bool,
}

impl FairValueGap {
    pub fn size(&self) -> f64 {
        self.high - self.low
    }

    pub fn contains(&self, price: f64) -> bool {
        price >= self.low && price <= self.high
    }

    pub fn is_retired(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.filled || age_exceeds(self.created_at, now, max_age)
    }

    fn revisit(&mut self, candle: &Candle) {
        let size = self.size();
        if size <= 0.0 {
            self.fill_ratio = 1.0;
            return;
        }
        let depth = match self.direction {
            // Bullish gaps are revisited from above
            Direction::Bullish => (self.high - candle.low) / size,
            Direction::Bearish => (candle.high - self.low) / size,
        };
        self.fill_ratio = self.fill_ratio.max(depth.clamp(0.0, 1.0));
    }
}

#[derive(Debug, Clone, Default)]
pub struct FvgUpdate {
    pub created: Vec<FairValueGap>,
    pub touched: Vec<FairValueGap>,
}

#[derive(Debug, Clone)]
pub struct FvgDetector {
    min_size_pct: f64,
    fill_threshold: f64,
    max_age: Duration,
    gaps: Vec<FairValueGap>,
}

impl FvgDetector {
    pub fn new(min_size_pct: f64, fill_threshold: f64, max_age: Duration) -> Self {
        Self {
            min_size_pct,
            fill_threshold,
            max_age,
            gaps: Vec::new(),
        }
    }

    pub fn gaps(&self) -> &[FairValueGap] {
        &self.gaps
    }

    pub fn active(&self, now: DateTime<Utc>) -> impl Iterator<Item = &FairValueGap> {
        let max_age = self.max_age;
        self.gaps.iter().filter(move |g| !g.is_retired(now, max_age))
    }

    pub fn update(&mut self, window: &[Candle]) -> FvgUpdate {
        let mut update = FvgUpdate::default();
        let Some(current) = window.last() else {
            return update;
        };

        for gap in self.gaps.iter_mut().filter(|g| !g.filled) {
            gap.revisit(current);
            if gap.contains(current.close) {
                update.touched.push(gap.clone());
            }
            if gap.fill_ratio >= self.fill_threshold {
                gap.filled = true;
            }
        }

        if window.len() >= 3 {
            let [c1, c2, c3] = [
                &window[window.len() - 3],
                &window[window.len() - 2],
                current,
            ];
            let candidates = [
                (Direction::Bullish, c1.high, c3.low),
                (Direction::Bearish, c3.high, c1.low),
            ];
            for (direction, low, high) in candidates {
                if low >= high || c2.close <= 0.0 {
                    continue;
                }
                let size_pct = (high - low) / c2.close * 100.0;
                if size_pct < self.min_size_pct {
                    continue;
                }
                let gap = FairValueGap {
                    id: Uuid::new_v4(),
                    direction,
                    low,
                    high,
                    created_at: c2.open_time,
                    fill_ratio: 0.0,
                    filled: false,
                };
                tracing::debug!(
                    "FVG: {} {} [{:.2}, {:.2}] ({:.3}%)",
                    current.symbol,
                    direction,
                    low,
                    high,
                    size_pct
                );
                update.created.push(gap.clone());
                self.gaps.push(gap);
            }
        }

        update
    }

    /// Drop filled and expired gaps. Idempotent.
    pub fn prune(&mut self, now: DateTime<Utc>) -> Vec<FairValueGap> {
        let max_age = self.max_age;
        let (retired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.gaps)
            .into_iter()
            .partition(|g| g.is_retired(now, max_age));
        self.gaps = kept;
        retired
    }

    pub fn clear(&mut self) {
        self.gaps.clear();
    }
}
