//! Trading Core - market structure analysis and signal generation
//!
//! - Rolling candle windows per (symbol, timeframe)
//! - Swing / BoS / ChoCh detection
//! - Order blocks, fair value gaps and liquidity pools
//! - Top-down directional bias and confidence
//! - Signal screening and issuance
//! - Per-symbol orchestration

pub mod series;
pub mod indicators;
pub mod structure;
pub mod order_block;
pub mod fvg;
pub mod liquidity;
pub mod bias;
pub mod frame;
pub mod signals;
pub mod trader;

// Re-export commonly used types
pub use bias::{BiasState, FrameReading, SymbolBias};
pub use frame::{FrameState, Zone};
pub use fvg::FairValueGap;
pub use liquidity::{LiquidityPool, LiquiditySweep, PoolKind};
pub use order_block::OrderBlock;
pub use series::{CandleSeries, Upsert};
pub use signals::{ConfluenceFactor, Signal, SignalGenerator, SignalStatus};
pub use structure::{BreakKind, MarketStructure, StructureEvent, SwingPoint};
pub use trader::{EngineEvent, SymbolEngine};
