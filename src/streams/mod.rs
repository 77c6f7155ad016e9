//! Market data feeds

pub mod replay;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::{Candle, PriceTick};

pub use replay::{load_candles, load_ticks, merge};

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Candle(Candle),
    Tick(PriceTick),
}

impl FeedEvent {
    pub fn symbol(&self) -> &str {
        match self {
            FeedEvent::Candle(c) => &c.symbol,
            FeedEvent::Tick(t) => &t.symbol,
        }
    }

    /// When the event became known: candle close or tick time
    pub fn event_time(&self) -> DateTime<Utc> {
        match self {
            FeedEvent::Candle(c) => c.close_time(),
            FeedEvent::Tick(t) => t.time,
        }
    }
}

/// Push a prepared replay into `tx`; stops early when the receiver is gone
pub fn spawn_replay(events: Vec<FeedEvent>, tx: mpsc::Sender<FeedEvent>) -> tokio::task::JoinHandle<usize> {
    tokio::spawn(async move {
        let mut sent = 0;
        for event in events {
            if tx.send(event).await.is_err() {
                debug!("REPLAY: receiver closed after {} events", sent);
                break;
            }
            sent += 1;
        }
        sent
    })
}
