//! Layer Scorers
//!
//! Each evidence layer is reduced to a normalized `LayerScore` by a pure
//! reducer. Raw evidence arrives through an `EvidenceFeed`; a missing or
//! stale feed degrades that layer to confidence 0 instead of failing.

pub mod behavioral;
pub mod economic;
pub mod feed;
pub mod hard_data;
pub mod technical;

pub use behavioral::{BehavioralInputs, BehavioralScorer};
pub use economic::{EconomicInputs, EconomicScorer, MacroIndicator};
pub use feed::{EvidenceFeed, EvidenceSnapshot, InMemoryEvidenceFeed, JsonEvidenceFeed, Stamped};
pub use hard_data::{HardDataInputs, HardDataScorer};
pub use technical::{TechnicalInputs, TechnicalScorer};

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::error::EngineError;
use crate::types::{Layer, LayerScore, LayerScores};

/// Reduces one layer's raw evidence to a `LayerScore`
pub trait LayerScorer: Send + Sync {
    type Input;

    fn layer(&self) -> Layer;

    fn score(&self, input: &Self::Input) -> LayerScore;
}

/// The four scorers used by a fusion run. Each slot can be swapped for any
/// scorer over the same input type.
pub struct ScorerSet<
    H = HardDataScorer,
    T = TechnicalScorer,
    B = BehavioralScorer,
    E = EconomicScorer,
> {
    pub hard_data: H,
    pub technical: T,
    pub behavioral: B,
    pub economic: E,
    /// Evidence older than this is treated as missing
    pub max_staleness: Duration,
}

impl Default for ScorerSet {
    fn default() -> Self {
        Self::new(14, Duration::seconds(86_400))
    }
}

impl ScorerSet {
    pub fn new(rsi_period: usize, max_staleness: Duration) -> Self {
        Self {
            hard_data: HardDataScorer,
            technical: TechnicalScorer::new(rsi_period),
            behavioral: BehavioralScorer,
            economic: EconomicScorer,
            max_staleness,
        }
    }
}

impl<H, T, B, E> ScorerSet<H, T, B, E>
where
    H: LayerScorer<Input = HardDataInputs>,
    T: LayerScorer<Input = TechnicalInputs>,
    B: LayerScorer<Input = BehavioralInputs>,
    E: LayerScorer<Input = EconomicInputs>,
{
    /// Score a snapshot; absent or stale layers come back unavailable
    pub fn score_snapshot(&self, snapshot: &EvidenceSnapshot, now: DateTime<Utc>) -> LayerScores {
        LayerScores {
            hard_data: self.score_layer(&self.hard_data, snapshot.hard_data.as_ref(), now),
            technical: self.score_layer(&self.technical, snapshot.technical.as_ref(), now),
            behavioral: self.score_layer(&self.behavioral, snapshot.behavioral.as_ref(), now),
            economic: self.score_layer(&self.economic, snapshot.economic.as_ref(), now),
        }
    }

    /// Fetch from the feed and score. Feed failures never propagate.
    pub async fn score_symbol(
        &self,
        feed: &dyn EvidenceFeed,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> LayerScores {
        match feed.snapshot(symbol).await {
            Ok(Some(snapshot)) => self.score_snapshot(&snapshot, now),
            Ok(None) => {
                warn!(symbol = %symbol, "No evidence snapshot, all layers unavailable");
                Self::all_unavailable("no evidence snapshot")
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Evidence feed failed, all layers unavailable");
                Self::all_unavailable(&e.to_string())
            }
        }
    }

    fn score_layer<S: LayerScorer>(
        &self,
        scorer: &S,
        evidence: Option<&Stamped<S::Input>>,
        now: DateTime<Utc>,
    ) -> LayerScore {
        let layer = scorer.layer();
        match evidence {
            None => Self::degraded(layer, "feed missing".to_string()),
            Some(stamped) if now - stamped.as_of > self.max_staleness => {
                let age_hours = (now - stamped.as_of).num_minutes() as f64 / 60.0;
                Self::degraded(layer, format!("feed stale ({:.1}h old)", age_hours))
            }
            Some(stamped) => scorer.score(&stamped.data),
        }
    }

    fn degraded(layer: Layer, reason: String) -> LayerScore {
        let err = EngineError::DataUnavailable {
            layer,
            reason: reason.clone(),
        };
        warn!(layer = %layer, "{}, confidence degraded to 0", err);
        LayerScore::unavailable(reason)
    }

    fn all_unavailable(reason: &str) -> LayerScores {
        LayerScores {
            hard_data: LayerScore::unavailable(reason),
            technical: LayerScore::unavailable(reason),
            behavioral: LayerScore::unavailable(reason),
            economic: LayerScore::unavailable(reason),
        }
    }
}

/// Weighted mean over the components that are present
pub(crate) fn weighted_mean(components: &[(f64, f64)]) -> Option<f64> {
    let total: f64 = components.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        return None;
    }
    Some(components.iter().map(|(v, w)| v * w).sum::<f64>() / total)
}

/// Share of non-zero components whose sign matches `composite`
pub(crate) fn sign_agreement(values: &[f64], composite: f64) -> f64 {
    let voting: Vec<f64> = values.iter().copied().filter(|v| *v != 0.0).collect();
    if voting.is_empty() || composite == 0.0 {
        return 0.0;
    }
    let agreeing = voting
        .iter()
        .filter(|v| v.signum() == composite.signum())
        .count();
    agreeing as f64 / voting.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 13, 14, 0, 0).unwrap()
    }

    fn full_snapshot(as_of: DateTime<Utc>) -> EvidenceSnapshot {
        EvidenceSnapshot {
            hard_data: Some(Stamped::new(
                as_of,
                HardDataInputs {
                    order_flow_imbalance: 0.4,
                    dark_pool_buy_ratio: Some(0.6),
                    put_call_ratio: Some(0.8),
                    institutional_net_flow: Some(0.3),
                },
            )),
            technical: Some(Stamped::new(
                as_of,
                TechnicalInputs {
                    closes: (0..60).map(|i| 100.0 + i as f64 * 0.5).collect(),
                },
            )),
            behavioral: Some(Stamped::new(
                as_of,
                BehavioralInputs {
                    activity_anomaly_z: 0.5,
                    stated_sentiment: 0.2,
                    revealed_behavior: 0.3,
                    fear_index: 40.0,
                },
            )),
            economic: Some(Stamped::new(
                as_of,
                EconomicInputs {
                    indicators: vec![MacroIndicator {
                        name: "nonfarm_payrolls".into(),
                        surprise: 1.2,
                        impact: 1.0,
                    }],
                },
            )),
        }
    }

    #[test]
    fn test_fresh_snapshot_scores_every_layer() {
        let set: ScorerSet = ScorerSet::default();
        let scores = set.score_snapshot(&full_snapshot(now() - Duration::hours(1)), now());
        assert_eq!(scores.available_count(), 4);
        for (_, s) in scores.iter() {
            assert!((-100.0..=100.0).contains(&s.score));
            assert!((0.0..=100.0).contains(&s.confidence));
        }
    }

    #[test]
    fn test_stale_and_missing_layers_degrade() {
        let set: ScorerSet = ScorerSet::default();
        let mut snapshot = full_snapshot(now() - Duration::hours(30));
        snapshot.economic = None;
        let scores = set.score_snapshot(&snapshot, now());
        assert_eq!(scores.available_count(), 0);
        assert!(scores.hard_data.signals[0].contains("stale"));
        assert!(scores.economic.signals[0].contains("missing"));
        assert_eq!(scores.technical.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_missing_symbol_in_feed_is_unavailable() {
        let set: ScorerSet = ScorerSet::default();
        let feed = InMemoryEvidenceFeed::new();
        let scores = set.score_symbol(&feed, "QQQ", now()).await;
        assert_eq!(scores.available_count(), 0);

        feed.insert("QQQ", full_snapshot(now())).await;
        let scores = set.score_symbol(&feed, "QQQ", now()).await;
        assert_eq!(scores.available_count(), 4);
    }

    #[test]
    fn test_sign_agreement() {
        assert_eq!(sign_agreement(&[1.0, 2.0, -1.0, 0.0], 5.0), 2.0 / 3.0);
        assert_eq!(sign_agreement(&[], 5.0), 0.0);
        assert_eq!(weighted_mean(&[]), None);
    }
}
