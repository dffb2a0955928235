//! Evidence feeds
//!
//! Collectors live outside this crate; they drop per-symbol snapshots that
//! the feeds below hand to the scorers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::debug;

use super::{BehavioralInputs, EconomicInputs, HardDataInputs, TechnicalInputs};
use crate::error::EngineResult;

/// Evidence with the time it was observed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stamped<T> {
    pub as_of: DateTime<Utc>,
    pub data: T,
}

impl<T> Stamped<T> {
    pub fn new(as_of: DateTime<Utc>, data: T) -> Self {
        Self { as_of, data }
    }
}

/// Latest raw evidence for one symbol; any layer may be absent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSnapshot {
    #[serde(default)]
    pub hard_data: Option<Stamped<HardDataInputs>>,
    #[serde(default)]
    pub technical: Option<Stamped<TechnicalInputs>>,
    #[serde(default)]
    pub behavioral: Option<Stamped<BehavioralInputs>>,
    #[serde(default)]
    pub economic: Option<Stamped<EconomicInputs>>,
}

/// Best-effort source of evidence snapshots
#[async_trait]
pub trait EvidenceFeed: Send + Sync {
    /// `Ok(None)` when nothing is known about the symbol
    async fn snapshot(&self, symbol: &str) -> EngineResult<Option<EvidenceSnapshot>>;
}

/// Reads `<dir>/<SYMBOL>.json` written by the collectors
pub struct JsonEvidenceFeed {
    dir: PathBuf,
}

impl JsonEvidenceFeed {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{}.json", symbol.to_uppercase()))
    }
}

#[async_trait]
impl EvidenceFeed for JsonEvidenceFeed {
    async fn snapshot(&self, symbol: &str) -> EngineResult<Option<EvidenceSnapshot>> {
        let path = self.path_for(symbol);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "No evidence file");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }
}

/// Snapshots pushed in-process
#[derive(Default)]
pub struct InMemoryEvidenceFeed {
    snapshots: RwLock<HashMap<String, EvidenceSnapshot>>,
}

impl InMemoryEvidenceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, symbol: &str, snapshot: EvidenceSnapshot) {
        self.snapshots
            .write()
            .await
            .insert(symbol.to_uppercase(), snapshot);
    }
}

#[async_trait]
impl EvidenceFeed for InMemoryEvidenceFeed {
    async fn snapshot(&self, symbol: &str) -> EngineResult<Option<EvidenceSnapshot>> {
        Ok(self.snapshots.read().await.get(&symbol.to_uppercase()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("signalfuse_feed_{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_json_feed_reads_partial_snapshot() {
        let dir = temp_dir();
        std::fs::create_dir_all(&dir).unwrap();
        let as_of = Utc.with_ymd_and_hms(2026, 10, 13, 13, 0, 0).unwrap();
        let snapshot = EvidenceSnapshot {
            technical: Some(Stamped::new(
                as_of,
                TechnicalInputs {
                    closes: vec![100.0, 101.0, 102.5],
                },
            )),
            ..Default::default()
        };
        std::fs::write(dir.join("SPY.json"), serde_json::to_string(&snapshot).unwrap()).unwrap();

        let feed = JsonEvidenceFeed::new(&dir);
        let loaded = feed.snapshot("spy").await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert!(loaded.hard_data.is_none());

        assert!(feed.snapshot("QQQ").await.unwrap().is_none());

        std::fs::write(dir.join("IWM.json"), "{not json").unwrap();
        assert!(feed.snapshot("IWM").await.is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
