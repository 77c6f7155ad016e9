//! Signal Generator
//!
//! Screens entry candidates and issues signals. Gates run in a fixed order
//! and every failure carries a `RejectReason`:
//!
//! 1. emergency stop
//! 2. neutral symbol bias, then bias conflict with the anchor timeframe
//! 3. undetermined regime
//! 4. confidence below threshold
//! 5. duplicate (unexpired GENERATED signal, same side)
//! 6. cooldown since the last signal on the symbol
//!
//! An issued signal stays GENERATED until its position fills (EXECUTED),
//! its TTL elapses unfilled (EXPIRED) or risk refuses it (REJECTED).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;
use uuid::Uuid;

use super::bias::SymbolBias;
use super::structure::BreakKind;
use crate::error::{RejectReason, ValidationError};
use crate::types::{Bias, MarketRegime, Session, Side, Timeframe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalStatus {
    Generated,
    Executed,
    Expired,
    Rejected,
}

impl SignalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SignalStatus::Generated)
    }
}

impl fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalStatus::Generated => write!(f, "GENERATED"),
            SignalStatus::Executed => write!(f, "EXECUTED"),
            SignalStatus::Expired => write!(f, "EXPIRED"),
            SignalStatus::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Why a signal was taken
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "factor", rename_all = "snake_case")]
pub enum ConfluenceFactor {
    TimeframeTrend { timeframe: Timeframe, bias: Bias },
    StructureBreak { timeframe: Timeframe, kind: BreakKind, level: f64 },
    OrderBlock { timeframe: Timeframe, low: f64, high: f64 },
    FairValueGap { timeframe: Timeframe, low: f64, high: f64, fill_ratio: f64 },
    LiquiditySweep { timeframe: Timeframe, level: f64, extreme: f64 },
    LiquidityTarget { timeframe: Timeframe, level: f64 },
}

/// Zone an entry was triggered from
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EntryZoneKind {
    OrderBlock,
    FairValueGap,
}

/// A touch of a qualifying zone, before screening
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub side: Side,
    pub entry: f64,
    pub zone: EntryZoneKind,
    pub zone_low: f64,
    pub zone_high: f64,
    /// Price beyond which the setup is wrong (zone edge or sweep wick)
    pub invalidation: f64,
    pub confidence: f64,
    pub factors: Vec<ConfluenceFactor>,
    pub session: Session,
    pub regime: Option<MarketRegime>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub side: Side,
    pub entry: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub confidence: f64,
    pub factors: Vec<ConfluenceFactor>,
    pub session: Session,
    pub regime: MarketRegime,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: SignalStatus,
    pub reject_reason: Option<RejectReason>,
}

impl Signal {
    /// Build a GENERATED signal; confidence and stop geometry are checked here
    pub fn new(
        candidate: &Candidate,
        regime: MarketRegime,
        stop_loss: f64,
        take_profit: f64,
        ttl: Duration,
    ) -> Result<Self, ValidationError> {
        let confidence = candidate.confidence;
        if !(confidence.is_finite() && (0.0..=1.0).contains(&confidence)) {
            return Err(ValidationError::new(
                RejectReason::LowConfidence,
                format!("confidence {} outside [0, 1]", confidence),
            ));
        }

        let sign = candidate.side.sign();
        let stop_distance = sign * (candidate.entry - stop_loss);
        let reward_distance = sign * (take_profit - candidate.entry);
        if !(stop_distance.is_finite() && stop_distance > 0.0 && reward_distance > 0.0 && stop_loss > 0.0) {
            return Err(ValidationError::new(
                RejectReason::InvalidGeometry,
                format!(
                    "{} entry {:.4} stop {:.4} target {:.4}",
                    candidate.side, candidate.entry, stop_loss, take_profit
                ),
            ));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            symbol: candidate.symbol.clone(),
            timeframe: candidate.timeframe,
            side: candidate.side,
            entry: candidate.entry,
            stop_loss,
            take_profit,
            confidence,
            factors: candidate.factors.clone(),
            session: candidate.session,
            regime,
            generated_at: candidate.at,
            expires_at: candidate.at + ttl,
            status: SignalStatus::Generated,
            reject_reason: None,
        })
    }

    pub fn stop_distance(&self) -> f64 {
        (self.entry - self.stop_loss).abs()
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == SignalStatus::Generated && self.expires_at > now
    }
}

#[derive(Debug, Clone)]
pub struct SignalGenerator {
    symbol: String,
    threshold: f64,
    cooldown: Duration,
    ttl: Duration,
    last_generated: Option<DateTime<Utc>>,
    /// GENERATED signals awaiting fill or expiry
    live: Vec<Signal>,
}

impl SignalGenerator {
    pub fn new(symbol: &str, threshold: f64, cooldown: Duration, ttl: Duration) -> Self {
        Self {
            symbol: symbol.to_string(),
            threshold,
            cooldown,
            ttl,
            last_generated: None,
            live: Vec::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn last_generated(&self) -> Option<DateTime<Utc>> {
        self.last_generated
    }

    pub fn live(&self) -> &[Signal] {
        &self.live
    }

    /// Run every gate. Returns the regime the signal will carry.
    pub fn screen(
        &self,
        candidate: &Candidate,
        bias: &SymbolBias,
        halted: bool,
    ) -> Result<MarketRegime, ValidationError> {
        if halted {
            return Err(ValidationError::new(RejectReason::EmergencyStop, "emergency stop active"));
        }

        let Some(direction) = bias.direction.direction() else {
            return Err(ValidationError::new(
                RejectReason::NeutralBias,
                format!("{} bias is neutral", self.symbol),
            ));
        };
        if direction != candidate.side.direction() {
            return Err(ValidationError::new(
                RejectReason::BiasConflict,
                format!(
                    "{} entry against {} bias on {}",
                    candidate.side,
                    bias.direction,
                    bias.anchor.map(|t| t.to_string()).unwrap_or_default()
                ),
            ));
        }

        let Some(regime) = candidate.regime else {
            return Err(ValidationError::new(
                RejectReason::UndeterminedRegime,
                "no established structure on the entry timeframe",
            ));
        };

        if candidate.confidence < self.threshold {
            return Err(ValidationError::new(
                RejectReason::LowConfidence,
                format!("{:.3} < {:.3}", candidate.confidence, self.threshold),
            ));
        }

        if let Some(existing) = self
            .live
            .iter()
            .find(|s| s.side == candidate.side && s.is_live(candidate.at))
        {
            return Err(ValidationError::new(
                RejectReason::DuplicateSignal,
                format!("{} {} still active until {}", existing.side, existing.id, existing.expires_at),
            ));
        }

        if let Some(last) = self.last_generated {
            let elapsed = candidate.at - last;
            if elapsed < self.cooldown {
                return Err(ValidationError::new(
                    RejectReason::CooldownActive,
                    format!("{}s left", (self.cooldown - elapsed).num_seconds()),
                ));
            }
        }

        Ok(regime)
    }

    /// Issue a screened candidate; starts the cooldown
    pub fn issue(
        &mut self,
        candidate: &Candidate,
        regime: MarketRegime,
        stop_loss: f64,
        take_profit: f64,
    ) -> Result<Signal, ValidationError> {
        let signal = Signal::new(candidate, regime, stop_loss, take_profit, self.ttl)?;
        self.last_generated = Some(signal.generated_at);
        self.live.push(signal.clone());

        info!(
            "SIGNAL: {} {} @ {:.2} | SL {:.2} | TP {:.2} | conf {:.2} | {} {}",
            signal.symbol,
            signal.side,
            signal.entry,
            signal.stop_loss,
            signal.take_profit,
            signal.confidence,
            signal.session,
            signal.regime
        );

        Ok(signal)
    }

    /// Move a live signal to a terminal status and return it
    pub fn resolve(
        &mut self,
        id: Uuid,
        status: SignalStatus,
        reason: Option<RejectReason>,
    ) -> Option<Signal> {
        let idx = self.live.iter().position(|s| s.id == id)?;
        let mut signal = self.live.remove(idx);
        signal.status = status;
        signal.reject_reason = reason;
        Some(signal)
    }

    /// Expire every live signal whose TTL has elapsed
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<Signal> {
        let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.live)
            .into_iter()
            .partition(|s| s.expires_at <= now);
        self.live = live;
        expired
            .into_iter()
            .map(|mut s| {
                s.status = SignalStatus::Expired;
                info!("EXPIRED: signal {} {} {}", s.symbol, s.side, s.id);
                s
            })
            .collect()
    }

    pub fn next_expiry(&self) -> Option<DateTime<Utc>> {
        self.live.iter().map(|s| s.expires_at).min()
    }

    /// Emergency stop: every live signal expires now
    pub fn expire_all(&mut self) -> Vec<Signal> {
        std::mem::take(&mut self.live)
            .into_iter()
            .map(|mut s| {
                s.status = SignalStatus::Expired;
                s
            })
            .collect()
    }

    /// Cooldown anchor from persisted history
    pub fn note_generated(&mut self, at: DateTime<Utc>) {
        if self.last_generated.map_or(true, |t| at > t) {
            self.last_generated = Some(at);
        }
    }
}
