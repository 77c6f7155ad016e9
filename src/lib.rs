// Library crate - market-structure analysis, signals, risk and trade lifecycle

pub mod config;
pub mod error;
pub mod types;
pub mod trading_core;
pub mod execution;
pub mod persistence;
pub mod streams;
pub mod pipeline;
pub mod runtime;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, RejectReason};
pub use pipeline::Pipeline;
pub use types::*;
