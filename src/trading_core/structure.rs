//! Market Structure Analyzer
//!
//! Fractal swing detection and close-based structural breaks.
//!
//! - A bar is a swing high (low) when its high (low) is strictly beyond the
//!   highs (lows) of `K` bars on each side. It is confirmed `K` bars later.
//! - Break of Structure: a close beyond the latest unbroken swing in the
//!   prevailing direction (or with no trend established yet).
//! - Change of Character: the same close-based break against the trend.
//! - A swing level breaks once; later closes beyond it are ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::types::{Candle, Direction};

/// Swings kept per side
const SWING_HISTORY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwingKind {
    High,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwingPoint {
    pub kind: SwingKind,
    pub price: f64,
    pub time: DateTime<Utc>,
    /// Bar sequence number of the swing bar
    pub seq: u64,
    pub broken: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakKind {
    BreakOfStructure,
    ChangeOfCharacter,
}

impl fmt::Display for BreakKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakKind::BreakOfStructure => write!(f, "BOS"),
            BreakKind::ChangeOfCharacter => write!(f, "CHOCH"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureEvent {
    pub kind: BreakKind,
    pub direction: Direction,
    /// Swing level that was closed through
    pub level: f64,
    pub close: f64,
    /// Open time of the breaking candle
    pub time: DateTime<Utc>,
    pub seq: u64,
}

/// Result of feeding one candle
#[derive(Debug, Clone, Default)]
pub struct StructureUpdate {
    pub swings: Vec<SwingPoint>,
    pub event: Option<StructureEvent>,
}

#[derive(Debug, Clone)]
pub struct MarketStructure {
    strength: usize,
    highs: VecDeque<SwingPoint>,
    lows: VecDeque<SwingPoint>,
    trend: Option<Direction>,
    last_event: Option<StructureEvent>,
}

impl MarketStructure {
    pub fn new(strength: usize) -> Self {
        Self {
            strength: strength.max(1),
            highs: VecDeque::new(),
            lows: VecDeque::new(),
            trend: None,
            last_event: None,
        }
    }

    pub fn trend(&self) -> Option<Direction> {
        self.trend
    }

    pub fn last_event(&self) -> Option<&StructureEvent> {
        self.last_event.as_ref()
    }

    pub fn swing_highs(&self) -> impl Iterator<Item = &SwingPoint> {
        self.highs.iter()
    }

    pub fn swing_lows(&self) -> impl Iterator<Item = &SwingPoint> {
        self.lows.iter()
    }

    /// Break within `bars` of `seq`
    pub fn recent_break(&self, seq: u64, bars: usize) -> Option<&StructureEvent> {
        self.last_event
            .as_ref()
            .filter(|e| seq.saturating_sub(e.seq) <= bars as u64)
    }

    /// Feed the window after its newest candle (sequence `seq`) was appended
    pub fn update(&mut self, window: &[Candle], seq: u64) -> StructureUpdate {
        let mut update = StructureUpdate::default();
        let k = self.strength;
        let n = window.len();
        let Some(current) = window.last() else {
            return update;
        };

        if n >= 2 * k + 1 {
            let p = n - 1 - k;
            let pivot = &window[p];
            let neighbours = move || (p - k..=p + k).filter(move |&j| j != p).map(move |j| &window[j]);
            let swing_seq = seq.saturating_sub(k as u64);

            if neighbours().all(|c| c.high < pivot.high) {
                let swing = SwingPoint {
                    kind: SwingKind::High,
                    price: pivot.high,
                    time: pivot.open_time,
                    seq: swing_seq,
                    broken: false,
                };
                push_bounded(&mut self.highs, swing.clone());
                update.swings.push(swing);
            }
            if neighbours().all(|c| c.low > pivot.low) {
                let swing = SwingPoint {
                    kind: SwingKind::Low,
                    price: pivot.low,
                    time: pivot.open_time,
                    seq: swing_seq,
                    broken: false,
                };
                push_bounded(&mut self.lows, swing.clone());
                update.swings.push(swing);
            }
        }

        // Closes only; wicks never break structure
        let broke_high = self
            .highs
            .back_mut()
            .filter(|s| !s.broken && current.close > s.price);
        let direction_and_level = if let Some(swing) = broke_high {
            swing.broken = true;
            Some((Direction::Bullish, swing.price))
        } else if let Some(swing) = self
            .lows
            .back_mut()
            .filter(|s| !s.broken && current.close < s.price)
        {
            swing.broken = true;
            Some((Direction::Bearish, swing.price))
        } else {
            None
        };

        if let Some((direction, level)) = direction_and_level {
            let kind = if self.trend == Some(direction.opposite()) {
                BreakKind::ChangeOfCharacter
            } else {
                BreakKind::BreakOfStructure
            };
            let event = StructureEvent {
                kind,
                direction,
                level,
                close: current.close,
                time: current.open_time,
                seq,
            };
            self.trend = Some(direction);
            self.last_event = Some(event.clone());
            update.event = Some(event);
        }

        update
    }
}

fn push_bounded(swings: &mut VecDeque<SwingPoint>, swing: SwingPoint) {
    swings.push_back(swing);
    while swings.len() > SWING_HISTORY {
        swings.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;
    use chrono::{Duration, TimeZone};

    fn bars(ohlc: &[(f64, f64, f64, f64)]) -> Vec<Candle> {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        ohlc.iter()
            .enumerate()
            .map(|(i, &(open, high, low, close))| Candle {
                symbol: "X".to_string(),
                timeframe: Timeframe::M15,
                open_time: t0 + Duration::minutes(15 * i as i64),
                open,
                high,
                low,
                close,
                volume: 1.0,
            })
            .collect()
    }

    fn run(candles: &[Candle], ms: &mut MarketStructure) -> Vec<StructureEvent> {
        let mut events = Vec::new();
        for n in 1..=candles.len() {
            if let Some(e) = ms.update(&candles[..n], n as u64 - 1).event {
                events.push(e);
            }
        }
        events
    }

    #[test]
    fn test_swing_high_requires_strict_extreme() {
        let candles = bars(&[
            (10.0, 11.0, 9.5, 10.5),
            (10.5, 12.0, 10.0, 11.5),
            (11.5, 14.0, 11.0, 12.0),
            (12.0, 13.0, 11.2, 11.5),
            (11.5, 12.5, 10.8, 11.0),
        ]);
        let mut ms = MarketStructure::new(2);
        run(&candles, &mut ms);
        let highs: Vec<_> = ms.swing_highs().collect();
        assert_eq!(highs.len(), 1);
        assert_eq!(highs[0].price, 14.0);
        assert_eq!(highs[0].seq, 2);
    }

    #[test]
    fn test_wick_does_not_break_close_does_once() {
        let candles = bars(&[
            (10.0, 11.0, 9.5, 10.5),
            (10.5, 12.0, 10.0, 11.5),
            (11.5, 14.0, 11.0, 12.0),
            (12.0, 13.0, 11.2, 11.5),
            (11.5, 12.5, 10.8, 11.0),
            // Wick above 14 closes below
            (11.0, 14.5, 10.9, 13.5),
            // Close above 14: BOS
            (13.5, 15.0, 13.4, 14.8),
            // Second close above 14: debounced
            (14.8, 15.5, 14.6, 15.2),
        ]);
        let mut ms = MarketStructure::new(2);
        let events = run(&candles, &mut ms);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, BreakKind::BreakOfStructure);
        assert_eq!(events[0].direction, Direction::Bullish);
        assert_eq!(events[0].level, 14.0);
        assert_eq!(events[0].seq, 6);
        assert_eq!(ms.trend(), Some(Direction::Bullish));
    }

    #[test]
    fn test_change_of_character_against_trend() {
        let candles = bars(&[
            (10.0, 11.0, 9.5, 10.5),
            (10.5, 12.0, 10.0, 11.5),
            (11.5, 14.0, 11.0, 12.0),
            (12.0, 13.0, 11.2, 11.5),
            (11.5, 12.5, 10.8, 11.0),
            (11.0, 15.0, 10.9, 14.8),  // BOS up through 14
            (14.8, 15.2, 14.0, 14.5),
            (14.5, 14.6, 12.0, 12.2),
            (12.2, 12.5, 10.0, 10.4),  // close below swing low 10.8: CHOCH
        ]);
        let mut ms = MarketStructure::new(2);
        let events = run(&candles, &mut ms);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, BreakKind::ChangeOfCharacter);
        assert_eq!(events[1].direction, Direction::Bearish);
        assert_eq!(ms.trend(), Some(Direction::Bearish));
        assert!(ms.recent_break(8, 0).is_some());
        assert!(ms.recent_break(30, 20).is_none());
    }
}
