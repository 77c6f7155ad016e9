//! Liquidity Pool Detector
//!
//! Equal highs/lows: a new swing within `tolerance_pct` of an active pool
//! joins it; otherwise it pairs with one of the recent swings of the same
//! kind to open a new pool at the more extreme price.
//!
//! Equal lows are swept when a candle wicks below the level and closes back
//! above it (bullish), and broken when it closes below. Mirror for highs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use uuid::Uuid;

use super::order_block::age_exceeds;
use super::structure::{SwingKind, SwingPoint};
use crate::types::{Candle, Direction};

/// Prior swings a new swing may pair with
const PAIRING_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolKind {
    EqualHighs,
    EqualLows,
}

impl PoolKind {
    /// Direction of the reversal a sweep of this pool implies
    pub fn sweep_direction(&self) -> Direction {
        match self {
            PoolKind::EqualLows => Direction::Bullish,
            PoolKind::EqualHighs => Direction::Bearish,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityPool {
    pub id: Uuid,
    pub kind: PoolKind,
    pub level: f64,
    pub touches: u32,
    pub created_at: DateTime<Utc>,
    pub swept: bool,
    /// Closed through without reclaim
    pub broken: bool,
}

impl LiquidityPool {
    pub fn is_retired(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.swept || self.broken || age_exceeds(self.created_at, now, max_age)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquiditySweep {
    pub pool_id: Uuid,
    pub direction: Direction,
    pub level: f64,
    /// Wick extreme beyond the level
    pub extreme: f64,
    pub time: DateTime<Utc>,
    pub seq: u64,
}

#[derive(Debug, Clone, Default)]
pub struct LiquidityUpdate {
    pub created: Vec<LiquidityPool>,
    pub swept: Vec<LiquiditySweep>,
}

#[derive(Debug, Clone)]
pub struct LiquidityDetector {
    tolerance_pct: f64,
    max_age: Duration,
    pools: Vec<LiquidityPool>,
    recent_highs: VecDeque<f64>,
    recent_lows: VecDeque<f64>,
    last_sweep: Option<LiquiditySweep>,
}

impl LiquidityDetector {
    pub fn new(tolerance_pct: f64, max_age: Duration) -> Self {
        Self {
            tolerance_pct,
            max_age,
            pools: Vec::new(),
            recent_highs: VecDeque::new(),
            recent_lows: VecDeque::new(),
            last_sweep: None,
        }
    }

    pub fn pools(&self) -> &[LiquidityPool] {
        &self.pools
    }

    pub fn active(&self, now: DateTime<Utc>) -> impl Iterator<Item = &LiquidityPool> {
        let max_age = self.max_age;
        self.pools.iter().filter(move |p| !p.is_retired(now, max_age))
    }

    pub fn last_sweep(&self) -> Option<&LiquiditySweep> {
        self.last_sweep.as_ref()
    }

    /// Sweep within `bars` of `seq`
    pub fn recent_sweep(&self, seq: u64, bars: usize) -> Option<&LiquiditySweep> {
        self.last_sweep
            .as_ref()
            .filter(|s| seq.saturating_sub(s.seq) <= bars as u64)
    }

    fn within_tolerance(&self, a: f64, reference: f64) -> bool {
        reference > 0.0 && (a - reference).abs() / reference * 100.0 <= self.tolerance_pct
    }

    /// Feed the newest candle and any swings it confirmed
    pub fn update(&mut self, candle: &Candle, swings: &[SwingPoint], seq: u64) -> LiquidityUpdate {
        let mut update = LiquidityUpdate::default();

        // Only pools that existed before this candle can be swept by it
        for pool in self.pools.iter_mut().filter(|p| !p.swept && !p.broken) {
            let (wicked, reclaimed, closed_through, extreme) = match pool.kind {
                PoolKind::EqualLows => (
                    candle.low < pool.level,
                    candle.close > pool.level,
                    candle.close < pool.level,
                    candle.low,
                ),
                PoolKind::EqualHighs => (
                    candle.high > pool.level,
                    candle.close < pool.level,
                    candle.close > pool.level,
                    candle.high,
                ),
            };
            if wicked && reclaimed {
                pool.swept = true;
                let sweep = LiquiditySweep {
                    pool_id: pool.id,
                    direction: pool.kind.sweep_direction(),
                    level: pool.level,
                    extreme,
                    time: candle.open_time,
                    seq,
                };
                tracing::debug!(
                    "SWEEP: {} {:?} {:.2} (wick {:.2})",
                    candle.symbol,
                    pool.kind,
                    pool.level,
                    extreme
                );
                self.last_sweep = Some(sweep.clone());
                update.swept.push(sweep);
            } else if closed_through {
                pool.broken = true;
            }
        }

        for swing in swings {
            let kind = match swing.kind {
                SwingKind::High => PoolKind::EqualHighs,
                SwingKind::Low => PoolKind::EqualLows,
            };
            let extreme = |a: f64, b: f64| match kind {
                PoolKind::EqualHighs => a.max(b),
                PoolKind::EqualLows => a.min(b),
            };

            let mut joined = false;
            for i in 0..self.pools.len() {
                let pool = &self.pools[i];
                if pool.swept || pool.broken || pool.kind != kind {
                    continue;
                }
                if self.within_tolerance(swing.price, pool.level) {
                    let pool = &mut self.pools[i];
                    pool.level = extreme(pool.level, swing.price);
                    pool.touches += 1;
                    joined = true;
                }
            }

            let history = match kind {
                PoolKind::EqualHighs => &self.recent_highs,
                PoolKind::EqualLows => &self.recent_lows,
            };
            if !joined {
                let partner = history
                    .iter()
                    .copied()
                    .find(|&prior| self.within_tolerance(swing.price, prior));
                if let Some(prior) = partner {
                    let pool = LiquidityPool {
                        id: Uuid::new_v4(),
                        kind,
                        level: extreme(swing.price, prior),
                        touches: 2,
                        created_at: candle.open_time,
                        swept: false,
                        broken: false,
                    };
                    tracing::debug!("POOL: {} {:?} @ {:.2}", candle.symbol, kind, pool.level);
                    update.created.push(pool.clone());
                    self.pools.push(pool);
                }
            }

            let history = match kind {
                PoolKind::EqualHighs => &mut self.recent_highs,
                PoolKind::EqualLows => &mut self.recent_lows,
            };
            history.push_back(swing.price);
            while history.len() > PAIRING_WINDOW {
                history.pop_front();
            }
        }

        update
    }

    /// Drop swept, broken and expired pools. Idempotent.
    pub fn prune(&mut self, now: DateTime<Utc>) -> Vec<LiquidityPool> {
        let max_age = self.max_age;
        let (retired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pools)
            .into_iter()
            .partition(|p| p.is_retired(now, max_age));
        self.pools = kept;
        retired
    }

    pub fn clear(&mut self) {
        self.pools.clear();
        self.recent_highs.clear();
        self.recent_lows.clear();
        self.last_sweep = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;
    use chrono::TimeZone;

    fn candle(i: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            symbol: "X".to_string(),
            timeframe: Timeframe::M15,
            open_time: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()
                + chrono::Duration::minutes(15 * i),
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    fn low_swing(price: f64, seq: u64) -> SwingPoint {
        SwingPoint {
            kind: SwingKind::Low,
            price,
            time: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            seq,
            broken: false,
        }
    }

    #[test]
    fn test_equal_lows_pool_and_sweep() {
        let mut det = LiquidityDetector::new(0.1, Duration::from_secs(86_400));
        let c = candle(0, 101.0, 101.5, 100.5, 101.0);
        det.update(&c, &[low_swing(100.0, 0)], 0);
        let update = det.update(&c, &[low_swing(100.05, 4)], 4);
        assert_eq!(update.created.len(), 1);
        assert_eq!(update.created[0].level, 100.0);

        // A third equal low joins instead of opening another pool
        let update = det.update(&c, &[low_swing(99.98, 6)], 6);
        assert!(update.created.is_empty());
        assert_eq!(det.pools()[0].touches, 3);
        assert_eq!(det.pools()[0].level, 99.98);

        // Wick below, close back above
        let sweep_bar = candle(8, 100.5, 100.8, 99.7, 100.4);
        let update = det.update(&sweep_bar, &[], 8);
        assert_eq!(update.swept.len(), 1);
        assert_eq!(update.swept[0].direction, Direction::Bullish);
        assert_eq!(update.swept[0].extreme, 99.7);
        assert!(det.pools()[0].swept);
        assert!(det.recent_sweep(10, 5).is_some());
        assert!(det.recent_sweep(20, 5).is_none());
    }

    #[test]
    fn test_close_through_breaks_pool() {
        let mut det = LiquidityDetector::new(0.1, Duration::from_secs(86_400));
        let c = candle(0, 101.0, 101.5, 100.5, 101.0);
        det.update(&c, &[low_swing(100.0, 0)], 0);
        det.update(&c, &[low_swing(100.02, 4)], 4);

        let through = candle(6, 100.5, 100.6, 99.0, 99.2);
        let update = det.update(&through, &[], 6);
        assert!(update.swept.is_empty());
        assert!(det.pools()[0].broken);
        assert_eq!(det.prune(through.close_time()).len(), 1);
        assert!(det.pools().is_empty());
    }

    #[test]
    fn test_far_swings_do_not_pair() {
        let mut det = LiquidityDetector::new(0.1, Duration::from_secs(86_400));
        let c = candle(0, 101.0, 101.5, 100.5, 101.0);
        det.update(&c, &[low_swing(100.0, 0)], 0);
        let update = det.update(&c, &[low_swing(100.5, 4)], 4);
        assert!(update.created.is_empty());
    }
}
