//! SignalFuse Library
//!
//! Multi-layer market-signal fusion with self-calibrating layer weights,
//! an outcome ledger and session-aware backtesting.

pub mod backtesting;
pub mod calibration;
pub mod config;
pub mod error;
pub mod fusion;
pub mod ledger;
pub mod patterns;
pub mod persistence;
pub mod pipeline;
pub mod scorers;
pub mod session;
pub mod types;

#[cfg(feature = "dashboard")]
pub mod dashboard;

pub use error::{EngineError, EngineResult};
