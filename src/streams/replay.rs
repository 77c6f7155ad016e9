//! Historical replay from CSV
//!
//! Candles: `symbol,timeframe,open_time,open,high,low,close,volume`
//! Ticks:   `symbol,time,price`
//!
//! Times are RFC 3339 or Unix milliseconds. Rows that fail to parse are
//! logged and skipped; validation of the values happens in the engine.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

use super::FeedEvent;
use crate::types::{Candle, PriceTick, Timeframe};

#[derive(Debug, Deserialize)]
struct CandleRow {
    symbol: String,
    timeframe: String,
    open_time: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

#[derive(Debug, Deserialize)]
struct TickRow {
    symbol: String,
    time: String,
    price: f64,
}

pub fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ms) = raw.parse::<i64>() {
        return Utc.timestamp_millis_opt(ms).single();
    }
    DateTime::parse_from_rfc3339(raw).ok().map(|t| t.with_timezone(&Utc))
}

impl CandleRow {
    fn into_candle(self) -> Option<Candle> {
        let timeframe: Timeframe = self.timeframe.parse().ok()?;
        let open_time = parse_time(&self.open_time)?;
        Some(Candle {
            symbol: self.symbol,
            timeframe,
            open_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        })
    }
}

pub fn read_candles<R: Read>(reader: R) -> Vec<Candle> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut candles = Vec::new();
    let mut skipped = 0u64;

    for (n, result) in csv_reader.deserialize::<CandleRow>().enumerate() {
        match result.map(CandleRow::into_candle) {
            Ok(Some(candle)) => candles.push(candle),
            Ok(None) => {
                skipped += 1;
                warn!("REPLAY: candle row {} has a bad timeframe or time", n + 1);
            }
            Err(e) => {
                skipped += 1;
                warn!("REPLAY: candle row {}: {}", n + 1, e);
            }
        }
    }

    if skipped > 0 {
        debug!("REPLAY: skipped {} candle rows", skipped);
    }
    candles
}

pub fn read_ticks<R: Read>(reader: R) -> Vec<PriceTick> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut ticks = Vec::new();

    for (n, result) in csv_reader.deserialize::<TickRow>().enumerate() {
        match result {
            Ok(row) => match parse_time(&row.time) {
                Some(time) => ticks.push(PriceTick {
                    symbol: row.symbol,
                    price: row.price,
                    time,
                }),
                None => warn!("REPLAY: tick row {} has a bad time {:?}", n + 1, row.time),
            },
            Err(e) => warn!("REPLAY: tick row {}: {}", n + 1, e),
        }
    }
    ticks
}

pub fn load_candles(path: &Path) -> Result<Vec<Candle>> {
    let file = std::fs::File::open(path).with_context(|| format!("Failed to open candles: {:?}", path))?;
    Ok(read_candles(std::io::BufReader::new(file)))
}

pub fn load_ticks(path: &Path) -> Result<Vec<PriceTick>> {
    let file = std::fs::File::open(path).with_context(|| format!("Failed to open ticks: {:?}", path))?;
    Ok(read_ticks(std::io::BufReader::new(file)))
}

/// One time-ordered stream. A candle counts at its close; at equal times
/// candles go before ticks.
pub fn merge(candles: Vec<Candle>, ticks: Vec<PriceTick>) -> Vec<FeedEvent> {
    let mut events: Vec<FeedEvent> = candles
        .into_iter()
        .map(FeedEvent::Candle)
        .chain(ticks.into_iter().map(FeedEvent::Tick))
        .collect();
    events.sort_by_key(|e| (e.event_time(), matches!(e, FeedEvent::Tick(_))));
    events
}
