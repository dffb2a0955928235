//! Accuracy and probability-calibration metrics over ledger rows

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Direction, Layer, MarketPrediction, PredictionStatus};

const CALIBRATION_BINS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CalibrationBin {
    pub count: usize,
    pub sum_p: f64,
    pub sum_y: f64,
}

/// Brier score and ECE of a stream of (probability, hit) pairs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationMetrics {
    pub sample_count: usize,
    pub brier_sum: f64,
    pub bins: Vec<CalibrationBin>,
}

impl Default for CalibrationMetrics {
    fn default() -> Self {
        Self {
            sample_count: 0,
            brier_sum: 0.0,
            bins: vec![CalibrationBin::default(); CALIBRATION_BINS],
        }
    }
}

impl CalibrationMetrics {
    pub fn record(&mut self, p_pred: f64, hit: bool) {
        let p = p_pred.clamp(0.0, 1.0);
        let y = if hit { 1.0 } else { 0.0 };

        self.sample_count += 1;
        self.brier_sum += (p - y).powi(2);

        let idx = ((p * CALIBRATION_BINS as f64).floor() as usize).min(CALIBRATION_BINS - 1);
        if let Some(bin) = self.bins.get_mut(idx) {
            bin.count += 1;
            bin.sum_p += p;
            bin.sum_y += y;
        }
    }

    pub fn brier_score(&self) -> Option<f64> {
        if self.sample_count == 0 {
            None
        } else {
            Some(self.brier_sum / self.sample_count as f64)
        }
    }

    pub fn ece(&self) -> Option<f64> {
        if self.sample_count == 0 {
            return None;
        }
        let total = self.sample_count as f64;
        let mut ece = 0.0;
        for bin in &self.bins {
            if bin.count == 0 {
                continue;
            }
            let n = bin.count as f64;
            ece += (n / total) * (bin.sum_p / n - bin.sum_y / n).abs();
        }
        Some(ece)
    }
}

/// Calibration quality of one layer's own calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerQuality {
    pub layer: Layer,
    pub sample_count: usize,
    pub accuracy: Option<f64>,
    pub brier_score: Option<f64>,
}

/// Headline accuracy numbers for the dashboard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccuracyMetrics {
    pub accuracy_7d: Option<f64>,
    pub accuracy_30d: Option<f64>,
    pub accuracy_all: Option<f64>,
    pub total: usize,
    pub pending: usize,
    pub correct: usize,
    pub incorrect: usize,
    pub expired: usize,
    /// Of `direction_probability` against the realized hit
    pub brier_score: Option<f64>,
    pub ece: Option<f64>,
    pub layers: Vec<LayerQuality>,
}

fn ratio(hits: usize, total: usize) -> Option<f64> {
    (total > 0).then(|| hits as f64 / total as f64)
}

impl AccuracyMetrics {
    /// Only `correct | incorrect` rows enter any denominator; windows are by prediction date
    pub fn compute(predictions: &[MarketPrediction], now: DateTime<Utc>, layer_band: f64) -> Self {
        let count = |s: PredictionStatus| predictions.iter().filter(|p| p.status == s).count();
        let scored: Vec<&MarketPrediction> =
            predictions.iter().filter(|p| p.status.is_scored()).collect();

        let window = |days: i64| {
            let since = now - Duration::days(days);
            let in_window: Vec<_> = scored.iter().filter(|p| p.prediction_date >= since).collect();
            let hits = in_window
                .iter()
                .filter(|p| p.status == PredictionStatus::Correct)
                .count();
            ratio(hits, in_window.len())
        };

        let mut probability = CalibrationMetrics::default();
        for p in &scored {
            probability.record(p.direction_probability, p.status == PredictionStatus::Correct);
        }

        let layers = Layer::ALL
            .into_iter()
            .map(|layer| {
                let mut quality = CalibrationMetrics::default();
                let mut hits = 0;
                for p in &scored {
                    let reading = p.layer_breakdown.get(layer);
                    let Some(outcome) = p.outcome.as_ref() else {
                        continue;
                    };
                    if !reading.available {
                        continue;
                    }
                    let call = Direction::from_score(reading.score, layer_band);
                    let hit = call == outcome.actual_direction;
                    if hit {
                        hits += 1;
                    }
                    quality.record(0.5 + reading.score.abs() / 200.0, hit);
                }
                LayerQuality {
                    layer,
                    sample_count: quality.sample_count,
                    accuracy: ratio(hits, quality.sample_count),
                    brier_score: quality.brier_score(),
                }
            })
            .collect();

        let correct = count(PredictionStatus::Correct);
        Self {
            accuracy_7d: window(7),
            accuracy_30d: window(30),
            accuracy_all: ratio(correct, scored.len()),
            total: predictions.len(),
            pending: count(PredictionStatus::Pending),
            correct,
            incorrect: count(PredictionStatus::Incorrect),
            expired: count(PredictionStatus::Expired),
            brier_score: probability.brier_score(),
            ece: probability.ece(),
            layers,
        }
    }
}
