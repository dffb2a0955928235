//! Behavioral layer: time-of-day activity anomalies, the gap between what
//! people say and what they do, and aggregate fear readings.

use serde::{Deserialize, Serialize};

use super::LayerScorer;
use crate::types::{Layer, LayerScore};

const ANOMALY_Z: f64 = 2.0;
const DISSONANCE_ALERT: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehavioralInputs {
    /// Activity vs. the usual level for this hour, as a z-score
    pub activity_anomaly_z: f64,
    /// Stated sentiment from social sources, in [-1, 1]
    pub stated_sentiment: f64,
    /// Revealed positioning (flows, searches, app activity), in [-1, 1]
    pub revealed_behavior: f64,
    /// Fear index from social and dream-journal text, in [0, 100]
    pub fear_index: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BehavioralScorer;

impl LayerScorer for BehavioralScorer {
    type Input = BehavioralInputs;

    fn layer(&self) -> Layer {
        Layer::Behavioral
    }

    fn score(&self, input: &BehavioralInputs) -> LayerScore {
        let behavior = input.revealed_behavior.clamp(-1.0, 1.0);
        let sentiment = input.stated_sentiment.clamp(-1.0, 1.0);
        let fear = input.fear_index.clamp(0.0, 100.0);

        // Revealed behavior leads, fear above 50 drags the reading down
        let mut score = behavior * 60.0 + (50.0 - fear) * 0.8;
        let anomalous = input.activity_anomaly_z.abs() >= ANOMALY_Z;
        if anomalous {
            score *= 1.2;
        }

        let dissonance = (sentiment - behavior).abs();
        let mut confidence = 70.0 - 30.0 * dissonance;
        if anomalous {
            confidence += 10.0;
        }

        let mut signals = Vec::new();
        if fear >= 70.0 {
            signals.push(format!("fear index elevated ({:.0})", fear));
        } else if fear <= 30.0 {
            signals.push(format!("fear index subdued ({:.0})", fear));
        }
        if dissonance >= DISSONANCE_ALERT {
            signals.push(format!(
                "sentiment/behavior dissonance {:.2} (says {:+.2}, does {:+.2})",
                dissonance, sentiment, behavior
            ));
        }
        if anomalous {
            signals.push(format!(
                "activity anomaly z={:+.1} for this hour",
                input.activity_anomaly_z
            ));
        }
        signals.push(format!("revealed behavior {:+.2}", behavior));

        LayerScore::new(score, confidence, signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fear_spike_is_bearish() {
        let s = BehavioralScorer.score(&BehavioralInputs {
            activity_anomaly_z: 3.1,
            stated_sentiment: -0.6,
            revealed_behavior: -0.5,
            fear_index: 90.0,
        });
        // (-30 - 32) * 1.2
        assert!((s.score - (-74.4)).abs() < 1e-9);
        assert!(s.signals[0].contains("fear"));
        assert!(s.confidence > 70.0);
    }

    #[test]
    fn test_dissonance_reduces_confidence() {
        let calm = BehavioralScorer.score(&BehavioralInputs {
            activity_anomaly_z: 0.0,
            stated_sentiment: 0.3,
            revealed_behavior: 0.3,
            fear_index: 50.0,
        });
        let split = BehavioralScorer.score(&BehavioralInputs {
            activity_anomaly_z: 0.0,
            stated_sentiment: 0.9,
            revealed_behavior: -0.4,
            fear_index: 50.0,
        });
        assert!(split.confidence < calm.confidence);
        assert!(split.signals.iter().any(|s| s.contains("dissonance")));
    }
}
