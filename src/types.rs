//! Shared market data and classification types

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use chrono_tz::{America::New_York, Europe::London};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DataError;

/// Candle interval. Ordering follows duration, so `M1 < H4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn seconds(&self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1_800,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            "1h" | "60m" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" | "d" => Ok(Timeframe::D1),
            other => Err(DataError::Malformed(format!("unknown timeframe '{}'", other))),
        }
    }
}

/// Closed OHLCV bar keyed by (symbol, timeframe, open_time)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn close_time(&self) -> DateTime<Utc> {
        self.open_time + self.timeframe.duration()
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    /// Reject candles that would corrupt detector state.
    ///
    /// `now` bounds the open time: a bar that has not closed yet is not a
    /// closed candle.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), DataError> {
        let values = [self.open, self.high, self.low, self.close, self.volume];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DataError::NonFinite {
                symbol: self.symbol.clone(),
                at: self.open_time,
            });
        }
        if self.low <= 0.0 {
            return Err(DataError::NotPositive {
                symbol: self.symbol.clone(),
                price: self.low,
            });
        }
        if self.volume < 0.0 {
            return Err(DataError::OutOfRange {
                symbol: self.symbol.clone(),
                detail: format!("negative volume {}", self.volume),
            });
        }
        if self.high < self.low
            || self.high < self.open.max(self.close)
            || self.low > self.open.min(self.close)
        {
            return Err(DataError::InvertedRange {
                symbol: self.symbol.clone(),
                at: self.open_time,
            });
        }
        if self.open_time.timestamp().rem_euclid(self.timeframe.seconds()) != 0 {
            return Err(DataError::Misaligned {
                symbol: self.symbol.clone(),
                timeframe: self.timeframe,
                at: self.open_time,
            });
        }
        if self.close_time() > now {
            return Err(DataError::FutureTimestamp {
                symbol: self.symbol.clone(),
                at: self.open_time,
            });
        }
        Ok(())
    }
}

/// Latest trade price for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub price: f64,
    pub time: DateTime<Utc>,
}

impl PriceTick {
    pub fn validate(&self) -> Result<(), DataError> {
        if !self.price.is_finite() {
            return Err(DataError::NonFinite {
                symbol: self.symbol.clone(),
                at: self.time,
            });
        }
        if self.price <= 0.0 {
            return Err(DataError::NotPositive {
                symbol: self.symbol.clone(),
                price: self.price,
            });
        }
        Ok(())
    }
}

/// Direction of a structural move or zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Bullish,
    Bearish,
}

impl Direction {
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Bullish => Direction::Bearish,
            Direction::Bearish => Direction::Bullish,
        }
    }

    /// +1.0 for bullish, -1.0 for bearish
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Bullish => 1.0,
            Direction::Bearish => -1.0,
        }
    }

    pub fn side(&self) -> Side {
        match self {
            Direction::Bullish => Side::Buy,
            Direction::Bearish => Side::Sell,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Bullish => write!(f, "BULLISH"),
            Direction::Bearish => write!(f, "BEARISH"),
        }
    }
}

/// Trade side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn direction(&self) -> Direction {
        match self {
            Side::Buy => Direction::Bullish,
            Side::Sell => Direction::Bearish,
        }
    }

    /// +1.0 for buy, -1.0 for sell
    pub fn sign(&self) -> f64 {
        self.direction().sign()
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Directional classification of a timeframe or symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Bias {
    Bullish,
    Bearish,
    Neutral,
}

impl Bias {
    pub fn direction(&self) -> Option<Direction> {
        match self {
            Bias::Bullish => Some(Direction::Bullish),
            Bias::Bearish => Some(Direction::Bearish),
            Bias::Neutral => None,
        }
    }
}

impl From<Direction> for Bias {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Bullish => Bias::Bullish,
            Direction::Bearish => Bias::Bearish,
        }
    }
}

impl fmt::Display for Bias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bias::Bullish => write!(f, "BULLISH"),
            Bias::Bearish => write!(f, "BEARISH"),
            Bias::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Trading session a signal was generated in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Session {
    Asian,
    London,
    NewYork,
    LondonNewYorkOverlap,
}

impl Session {
    /// London and New York are 08:00-17:00 local time (DST aware);
    /// everything else is the Asian session.
    pub fn at(time: DateTime<Utc>) -> Self {
        let london_hour = London.from_utc_datetime(&time.naive_utc()).hour();
        let new_york_hour = New_York.from_utc_datetime(&time.naive_utc()).hour();
        let london = (8..17).contains(&london_hour);
        let new_york = (8..17).contains(&new_york_hour);

        match (london, new_york) {
            (true, true) => Session::LondonNewYorkOverlap,
            (true, false) => Session::London,
            (false, true) => Session::NewYork,
            (false, false) => Session::Asian,
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Session::Asian => write!(f, "ASIAN"),
            Session::London => write!(f, "LONDON"),
            Session::NewYork => write!(f, "NEW_YORK"),
            Session::LondonNewYorkOverlap => write!(f, "LONDON_NY_OVERLAP"),
        }
    }
}

/// Market regime on the entry timeframe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketRegime {
    /// Established trend with a recent confirmed break
    Trending,
    /// Established trend but no recent break
    Ranging,
}

impl fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketRegime::Trending => write!(f, "TRENDING"),
            MarketRegime::Ranging => write!(f, "RANGING"),
        }
    }
}
