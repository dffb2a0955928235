//! Economic layer: macro releases scored by surprise against consensus.

use serde::{Deserialize, Serialize};

use super::{sign_agreement, LayerScorer};
use crate::types::{Layer, LayerScore};

/// Releases needed for full coverage
const FULL_COVERAGE: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroIndicator {
    pub name: String,
    /// (actual - consensus) / historical surprise stdev
    pub surprise: f64,
    /// +1 when a beat is good for equities (payrolls, PMI), -1 when bad (CPI, claims)
    pub impact: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EconomicInputs {
    pub indicators: Vec<MacroIndicator>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EconomicScorer;

impl LayerScorer for EconomicScorer {
    type Input = EconomicInputs;

    fn layer(&self) -> Layer {
        Layer::Economic
    }

    fn score(&self, input: &EconomicInputs) -> LayerScore {
        if input.indicators.is_empty() {
            return LayerScore::unavailable("no macro releases");
        }

        let mut contributions: Vec<(f64, &MacroIndicator)> = input
            .indicators
            .iter()
            .map(|ind| ((ind.surprise.clamp(-4.0, 4.0) * ind.impact.signum()) * 25.0, ind))
            .collect();

        let values: Vec<f64> = contributions.iter().map(|(c, _)| *c).collect();
        let score = values.iter().sum::<f64>() / values.len() as f64;

        let coverage = (values.len() as f64 / FULL_COVERAGE).min(1.0);
        let agreement = sign_agreement(&values, score);
        let confidence = 80.0 * coverage * (0.5 + 0.5 * agreement) + 20.0 * coverage;

        contributions.sort_by(|a, b| {
            b.0.abs()
                .partial_cmp(&a.0.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let signals = contributions
            .iter()
            .map(|(c, ind)| {
                format!(
                    "{} surprise {:+.1}σ ({})",
                    ind.name,
                    ind.surprise,
                    if *c >= 0.0 { "supportive" } else { "headwind" }
                )
            })
            .collect();

        LayerScore::new(score, confidence, signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ind(name: &str, surprise: f64, impact: f64) -> MacroIndicator {
        MacroIndicator {
            name: name.into(),
            surprise,
            impact,
        }
    }

    #[test]
    fn test_hot_inflation_is_headwind() {
        let s = EconomicScorer.score(&EconomicInputs {
            indicators: vec![ind("cpi", 2.0, -1.0), ind("payrolls", 0.4, 1.0)],
        });
        // (-50 + 10) / 2
        assert!((s.score - (-20.0)).abs() < 1e-9);
        assert!(s.signals[0].starts_with("cpi"));
        assert!(s.signals[0].contains("headwind"));
    }

    #[test]
    fn test_no_releases_unavailable() {
        assert!(!EconomicScorer.score(&EconomicInputs::default()).available);
    }
}
