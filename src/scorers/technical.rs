//! Technical layer: Wilder RSI, momentum and moving-average structure over
//! daily closes.

use serde::{Deserialize, Serialize};

use super::LayerScorer;
use crate::types::{Layer, LayerScore};

const MOMENTUM_LOOKBACK: usize = 10;
const FAST_SMA: usize = 10;
const SLOW_SMA: usize = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechnicalInputs {
    /// Daily closes, oldest first
    pub closes: Vec<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct TechnicalScorer {
    rsi_period: usize,
}

impl Default for TechnicalScorer {
    fn default() -> Self {
        Self::new(14)
    }
}

impl TechnicalScorer {
    pub fn new(rsi_period: usize) -> Self {
        Self {
            rsi_period: rsi_period.max(2),
        }
    }
}

/// Wilder-smoothed RSI. Returns 50 when there are not `period + 1` closes.
pub fn wilder_rsi(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() < period + 1 {
        return 50.0;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let (mut avg_gain, mut avg_loss) = deltas[..period]
        .iter()
        .fold((0.0, 0.0), |(g, l), d| {
            if *d > 0.0 {
                (g + d, l)
            } else {
                (g, l - d)
            }
        });
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    let n = period as f64;
    for d in &deltas[period..] {
        let (gain, loss) = if *d > 0.0 { (*d, 0.0) } else { (0.0, -d) };
        avg_gain = (avg_gain * (n - 1.0) + gain) / n;
        avg_loss = (avg_loss * (n - 1.0) + loss) / n;
    }

    if avg_loss == 0.0 {
        return if avg_gain == 0.0 { 50.0 } else { 100.0 };
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// Percent change between the close `lookback` bars ago and the last close
pub fn change_percent(closes: &[f64], lookback: usize) -> Option<f64> {
    if closes.len() < 2 {
        return None;
    }
    let last = *closes.last()?;
    let start_idx = closes.len().saturating_sub(lookback + 1);
    let start = closes[start_idx];
    if start <= 0.0 {
        return None;
    }
    Some((last - start) / start * 100.0)
}

fn sma(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

impl LayerScorer for TechnicalScorer {
    type Input = TechnicalInputs;

    fn layer(&self) -> Layer {
        Layer::Technical
    }

    fn score(&self, input: &TechnicalInputs) -> LayerScore {
        let closes: Vec<f64> = input
            .closes
            .iter()
            .copied()
            .filter(|c| c.is_finite() && *c > 0.0)
            .collect();
        if closes.len() < 2 {
            return LayerScore::unavailable("not enough price history");
        }

        let mut signals = Vec::new();

        let rsi = wilder_rsi(&closes, self.rsi_period);
        // Mean-reversion reading: oversold is bullish, overbought bearish
        let rsi_component = ((50.0 - rsi) * 2.0).clamp(-100.0, 100.0);
        let rsi_label = if rsi < 30.0 {
            "oversold"
        } else if rsi > 70.0 {
            "overbought"
        } else {
            "neutral"
        };
        signals.push(format!("RSI({}) {:.1} {}", self.rsi_period, rsi, rsi_label));

        let momentum = change_percent(&closes, MOMENTUM_LOOKBACK).unwrap_or(0.0);
        let momentum_component = (momentum * 10.0).clamp(-100.0, 100.0);
        signals.push(format!(
            "{:+.2}% over {} bars",
            momentum,
            MOMENTUM_LOOKBACK.min(closes.len() - 1)
        ));

        let trend_component = match (sma(&closes, FAST_SMA), sma(&closes, SLOW_SMA)) {
            (Some(fast), Some(slow)) if slow > 0.0 => {
                let spread = (fast / slow - 1.0) * 100.0;
                signals.push(format!(
                    "SMA{} {} SMA{} ({:+.2}%)",
                    FAST_SMA,
                    if spread >= 0.0 { "above" } else { "below" },
                    SLOW_SMA,
                    spread
                ));
                Some((spread * 20.0).clamp(-100.0, 100.0))
            }
            _ => None,
        };

        let score = match trend_component {
            Some(trend) => 0.4 * rsi_component + 0.3 * momentum_component + 0.3 * trend,
            None => 0.5 * rsi_component + 0.5 * momentum_component,
        };

        // Confidence grows with history depth, RSI extremes add conviction
        let needed = (self.rsi_period + 1).max(SLOW_SMA) as f64;
        let depth = (closes.len() as f64 / needed).min(1.0);
        let extremity = ((rsi - 50.0).abs() / 50.0).min(1.0);
        let trend_bonus = if trend_component.is_some() { 10.0 } else { 0.0 };
        let confidence = depth * (50.0 + 40.0 * extremity + trend_bonus);

        LayerScore::new(score, confidence, signals)
    }
}
