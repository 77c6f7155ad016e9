//! Rolling candle window per (symbol, timeframe)
//!
//! Candles are keyed by open time. Late, revised and duplicate bars are
//! absorbed here so detectors only ever see an ordered window.

use std::collections::VecDeque;

use crate::types::{Candle, Timeframe};

/// What an upsert did to the window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// New bar after the last one
    Appended,
    /// Revision of the newest bar
    Replaced,
    /// Inserted or revised behind the newest bar
    Backfilled,
    /// Identical bar already present
    Duplicate,
    /// Older than anything the window still holds
    Stale,
}

impl Upsert {
    /// Detector state built from the old window is no longer valid
    pub fn requires_rebuild(&self) -> bool {
        matches!(self, Upsert::Replaced | Upsert::Backfilled)
    }
}

#[derive(Debug, Clone)]
pub struct CandleSeries {
    symbol: String,
    timeframe: Timeframe,
    capacity: usize,
    candles: VecDeque<Candle>,
}

impl CandleSeries {
    pub fn new(symbol: &str, timeframe: Timeframe, capacity: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            capacity: capacity.max(1),
            candles: VecDeque::with_capacity(capacity),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter()
    }

    /// Contiguous view of the window, oldest first
    pub fn as_slice(&mut self) -> &[Candle] {
        self.candles.make_contiguous()
    }

    pub fn upsert(&mut self, candle: Candle) -> Upsert {
        let last_time = match self.candles.back() {
            None => {
                self.candles.push_back(candle);
                return Upsert::Appended;
            }
            Some(last) => last.open_time,
        };

        if candle.open_time > last_time {
            self.candles.push_back(candle);
            while self.candles.len() > self.capacity {
                self.candles.pop_front();
            }
            return Upsert::Appended;
        }

        if candle.open_time == last_time {
            return match self.candles.back_mut() {
                Some(last) if *last == candle => Upsert::Duplicate,
                Some(last) => {
                    *last = candle;
                    Upsert::Replaced
                }
                None => Upsert::Stale,
            };
        }

        match self.candles.binary_search_by(|c| c.open_time.cmp(&candle.open_time)) {
            Ok(idx) => {
                if self.candles[idx] == candle {
                    Upsert::Duplicate
                } else {
                    self.candles[idx] = candle;
                    Upsert::Backfilled
                }
            }
            Err(0) if self.candles.len() >= self.capacity => Upsert::Stale,
            Err(idx) => {
                self.candles.insert(idx, candle);
                while self.candles.len() > self.capacity {
                    self.candles.pop_front();
                }
                Upsert::Backfilled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bar(i: i64, close: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::M15,
            open_time: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap() + Duration::minutes(15 * i),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn test_upsert_outcomes() {
        let mut series = CandleSeries::new("BTCUSDT", Timeframe::M15, 10);
        assert_eq!(series.upsert(bar(0, 100.0)), Upsert::Appended);
        assert_eq!(series.upsert(bar(2, 102.0)), Upsert::Appended);
        assert_eq!(series.upsert(bar(2, 102.0)), Upsert::Duplicate);
        assert_eq!(series.upsert(bar(2, 103.0)), Upsert::Replaced);
        assert_eq!(series.upsert(bar(1, 101.0)), Upsert::Backfilled);
        assert_eq!(series.upsert(bar(1, 101.0)), Upsert::Duplicate);

        let closes: Vec<f64> = series.iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![100.0, 101.0, 103.0]);
        assert!(Upsert::Backfilled.requires_rebuild());
        assert!(!Upsert::Appended.requires_rebuild());
    }

    #[test]
    fn test_window_is_bounded() {
        let mut series = CandleSeries::new("BTCUSDT", Timeframe::M15, 3);
        for i in 0..5 {
            series.upsert(bar(i, 100.0 + i as f64));
        }
        assert_eq!(series.len(), 3);
        assert_eq!(series.as_slice()[0].close, 102.0);

        // Older than the full window
        assert_eq!(series.upsert(bar(0, 100.0)), Upsert::Stale);
        assert_eq!(series.len(), 3);
    }
}
