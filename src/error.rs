use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::Layer;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("{layer} data unavailable: {reason}")]
    DataUnavailable { layer: Layer, reason: String },

    #[error("price unavailable for {symbol} at {at}")]
    PriceUnavailable { symbol: String, at: DateTime<Utc> },

    #[error("market calendar error: {0}")]
    Calendar(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("corrupt ledger row: {0}")]
    CorruptRow(String),

    #[error("ledger lock poisoned")]
    LockPoisoned,

    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
