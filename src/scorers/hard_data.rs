//! Hard data layer: order flow, dark pool prints, options positioning and
//! institutional filings.

use serde::{Deserialize, Serialize};

use super::{sign_agreement, weighted_mean, LayerScorer};
use crate::types::{Layer, LayerScore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardDataInputs {
    /// (buy volume - sell volume) / total volume, in [-1, 1]
    pub order_flow_imbalance: f64,
    /// Share of dark pool prints at or above the ask, in [0, 1]
    #[serde(default)]
    pub dark_pool_buy_ratio: Option<f64>,
    /// Put volume / call volume
    #[serde(default)]
    pub put_call_ratio: Option<f64>,
    /// Net institutional buying from filings, normalized to [-1, 1]
    #[serde(default)]
    pub institutional_net_flow: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HardDataScorer;

impl LayerScorer for HardDataScorer {
    type Input = HardDataInputs;

    fn layer(&self) -> Layer {
        Layer::HardData
    }

    fn score(&self, input: &HardDataInputs) -> LayerScore {
        // (signed component in [-100, 100], weight, description)
        let mut parts: Vec<(f64, f64, String)> = Vec::with_capacity(4);

        let flow = (input.order_flow_imbalance.clamp(-1.0, 1.0)) * 100.0;
        parts.push((
            flow,
            0.35,
            format!("order flow imbalance {:+.0}%", input.order_flow_imbalance * 100.0),
        ));

        if let Some(ratio) = input.dark_pool_buy_ratio {
            let v = ((ratio.clamp(0.0, 1.0) - 0.5) * 200.0).clamp(-100.0, 100.0);
            parts.push((v, 0.25, format!("dark pool buy ratio {:.0}%", ratio * 100.0)));
        }

        if let Some(pcr) = input.put_call_ratio {
            // 1.0 is balanced; heavy put buying reads bearish
            let v = ((1.0 - pcr) * 100.0).clamp(-100.0, 100.0);
            parts.push((v, 0.20, format!("put/call ratio {:.2}", pcr)));
        }

        if let Some(flow) = input.institutional_net_flow {
            let v = flow.clamp(-1.0, 1.0) * 100.0;
            parts.push((v, 0.20, format!("institutional net flow {:+.2}", flow)));
        }

        let components: Vec<(f64, f64)> = parts.iter().map(|(v, w, _)| (*v, *w)).collect();
        let score = weighted_mean(&components).unwrap_or(0.0);

        let values: Vec<f64> = parts.iter().map(|(v, _, _)| *v).collect();
        let coverage = parts.len() as f64 / 4.0;
        let confidence = 100.0 * coverage * (0.5 + 0.5 * sign_agreement(&values, score));

        parts.sort_by(|a, b| {
            (b.0 * b.1)
                .abs()
                .partial_cmp(&(a.0 * a.1).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let signals = parts.into_iter().map(|(_, _, s)| s).collect();

        LayerScore::new(score, confidence, signals)
    }
}
