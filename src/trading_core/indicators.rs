//! Volatility helpers

use crate::types::Candle;

/// True range of `bar` given the previous close
pub fn true_range(prev_close: f64, bar: &Candle) -> f64 {
    (bar.high - bar.low)
        .max((bar.high - prev_close).abs())
        .max((bar.low - prev_close).abs())
}

/// Simple average true range over the last `period` bars of `bars`.
///
/// Needs `period + 1` bars so every true range has a previous close.
pub fn atr(bars: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let window = &bars[bars.len() - period - 1..];
    let sum: f64 = window
        .windows(2)
        .map(|pair| true_range(pair[0].close, &pair[1]))
        .sum();

    Some(sum / period as f64)
}
