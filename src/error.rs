//! Error taxonomy
//!
//! `DataError` skips one update, `ValidationError` rejects one signal with an
//! explicit code, `PersistenceError` is retried and then spooled,
//! `Concurrency` retries the account mutation and `Configuration` is fatal at
//! startup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::Timeframe;

/// Malformed or missing market data
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
    #[error("{symbol}: non-finite value at {at}")]
    NonFinite { symbol: String, at: DateTime<Utc> },

    #[error("{symbol}: high/low do not bracket open/close at {at}")]
    InvertedRange { symbol: String, at: DateTime<Utc> },

    #[error("{symbol}: price {price} is not positive")]
    NotPositive { symbol: String, price: f64 },

    #[error("{symbol}: {detail}")]
    OutOfRange { symbol: String, detail: String },

    #[error("{symbol}: open time {at} is not aligned to {timeframe}")]
    Misaligned {
        symbol: String,
        timeframe: Timeframe,
        at: DateTime<Utc>,
    },

    #[error("{symbol}: candle opening {at} has not closed yet")]
    FutureTimestamp { symbol: String, at: DateTime<Utc> },

    #[error("malformed record: {0}")]
    Malformed(String),
}

/// Explicit reason code attached to every rejected candidate or signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    LowConfidence,
    CooldownActive,
    DuplicateSignal,
    SizeBelowMinimum,
    RiskCapExceeded,
    NeutralBias,
    BiasConflict,
    UndeterminedRegime,
    InvalidGeometry,
    EmergencyStop,
    DailyLossLimit,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::LowConfidence => "LOW_CONFIDENCE",
            RejectReason::CooldownActive => "COOLDOWN_ACTIVE",
            RejectReason::DuplicateSignal => "DUPLICATE_SIGNAL",
            RejectReason::SizeBelowMinimum => "SIZE_BELOW_MINIMUM",
            RejectReason::RiskCapExceeded => "RISK_CAP_EXCEEDED",
            RejectReason::NeutralBias => "NEUTRAL_BIAS",
            RejectReason::BiasConflict => "BIAS_CONFLICT",
            RejectReason::UndeterminedRegime => "UNDETERMINED_REGIME",
            RejectReason::InvalidGeometry => "INVALID_GEOMETRY",
            RejectReason::EmergencyStop => "EMERGENCY_STOP",
            RejectReason::DailyLossLimit => "DAILY_LOSS_LIMIT",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A candidate or signal failed a quality or risk gate
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{reason}: {detail}")]
pub struct ValidationError {
    pub reason: RejectReason,
    pub detail: String,
}

impl ValidationError {
    pub fn new(reason: RejectReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

/// Durable store failures
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("record not found: {0}")]
    NotFound(String),
}

impl PersistenceError {
    /// Worth retrying against the same store
    pub fn is_transient(&self) -> bool {
        matches!(self, PersistenceError::Unavailable(_) | PersistenceError::Io(_))
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::Codec(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("data error: {0}")]
    Data(#[from] DataError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("concurrent account update: {0}")]
    Concurrency(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

impl EngineError {
    pub fn rejected(reason: RejectReason, detail: impl Into<String>) -> Self {
        EngineError::Validation(ValidationError::new(reason, detail))
    }

    /// Only configuration errors stop the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Configuration(_))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Concurrency(_) => true,
            EngineError::Persistence(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            EngineError::Validation(v) => Some(v.reason),
            _ => None,
        }
    }
}
