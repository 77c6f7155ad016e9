//! Execution module - sizing, account bookkeeping and position lifecycle
//!
//! Paper execution only: PENDING positions fill when price trades through
//! the limit entry and close on stop, target or emergency stop.

pub mod account;
pub mod engine;
pub mod position;
pub mod risk;

pub use account::{AccountState, SharedAccount};
pub use engine::ExecutionEngine;
pub use position::{Position, PositionBook, PositionStatus};
pub use risk::{ExitLevels, RiskEngine, SizedOrder};
