//! Weight Calibrator
//!
//! Consumes resolved predictions exactly once, keeps decayed per-layer
//! accuracy keyed by (layer, regime, horizon, symbol), and writes a new
//! version of the fusion weight vector after each batch.
//! Learning is regime-aware: the same layer can be trusted in risk-on
//! markets and discounted in risk-off ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::EngineResult;
use crate::fusion::WeightRecord;
use crate::ledger::Ledger;
use crate::types::{Direction, Layer, Regime};

/// Row key of `LayerLearningHistory`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HistoryKey {
    pub layer: Layer,
    pub regime: Regime,
    pub horizon_days: u32,
    pub symbol: String,
}

/// Tunable constants of the online update
#[derive(Debug, Clone, Copy)]
pub struct LearningParams {
    /// Weight of the previous rolling accuracy, in (0, 1)
    pub decay_factor: f64,
    /// Gain `k` applied to (rolling accuracy - 0.5)
    pub gain: f64,
    /// Bound on |weight_adjustment|
    pub max_adjustment: f64,
}

impl Default for LearningParams {
    fn default() -> Self {
        Self {
            decay_factor: 0.95,
            gain: 0.2,
            max_adjustment: 0.10,
        }
    }
}

/// Decayed accuracy record of one layer in one (regime, horizon, symbol) cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerLearningHistory {
    pub layer: Layer,
    pub regime: Regime,
    pub horizon_days: u32,
    pub symbol: String,
    pub total_predictions: u64,
    pub correct_predictions: u64,
    /// correct / total
    pub accuracy: f64,
    /// Exponentially decayed accuracy, starts at a coin flip
    pub rolling_accuracy: f64,
    /// Exponentially weighted variance of outcomes around `rolling_accuracy`
    pub rolling_variance: f64,
    pub decay_factor: f64,
    pub avg_score_when_correct: f64,
    pub avg_score_when_wrong: f64,
    pub avg_confidence_when_correct: f64,
    pub avg_confidence_when_wrong: f64,
    pub optimal_score_threshold: Option<f64>,
    pub optimal_confidence_threshold: Option<f64>,
    /// Recommendation in [-max_adjustment, +max_adjustment]
    pub weight_adjustment: f64,
    pub updated_at: DateTime<Utc>,
}

impl LayerLearningHistory {
    pub fn new(key: HistoryKey, decay_factor: f64, now: DateTime<Utc>) -> Self {
        Self {
            layer: key.layer,
            regime: key.regime,
            horizon_days: key.horizon_days,
            symbol: key.symbol,
            total_predictions: 0,
            correct_predictions: 0,
            accuracy: 0.0,
            rolling_accuracy: 0.5,
            rolling_variance: 0.25,
            decay_factor,
            avg_score_when_correct: 0.0,
            avg_score_when_wrong: 0.0,
            avg_confidence_when_correct: 0.0,
            avg_confidence_when_wrong: 0.0,
            optimal_score_threshold: None,
            optimal_confidence_threshold: None,
            weight_adjustment: 0.0,
            updated_at: now,
        }
    }

    pub fn key(&self) -> HistoryKey {
        HistoryKey {
            layer: self.layer,
            regime: self.regime,
            horizon_days: self.horizon_days,
            symbol: self.symbol.clone(),
        }
    }

    pub fn wrong_predictions(&self) -> u64 {
        self.total_predictions - self.correct_predictions
    }

    /// Square root of the decayed outcome variance
    pub fn accuracy_volatility(&self) -> f64 {
        self.rolling_variance.max(0.0).sqrt()
    }

    /// Apply one resolved call. This is the only way a row changes.
    pub fn record(
        &mut self,
        correct: bool,
        score: f64,
        confidence: f64,
        params: &LearningParams,
        now: DateTime<Utc>,
    ) {
        let d = params.decay_factor.clamp(0.0, 1.0);
        let y = if correct { 1.0 } else { 0.0 };

        self.total_predictions += 1;
        if correct {
            self.correct_predictions += 1;
        }
        self.accuracy = self.correct_predictions as f64 / self.total_predictions as f64;

        let diff = y - self.rolling_accuracy;
        self.rolling_accuracy = d * self.rolling_accuracy + (1.0 - d) * y;
        self.rolling_variance = d * (self.rolling_variance + (1.0 - d) * diff * diff);
        self.decay_factor = d;

        let magnitude = score.abs();
        if correct {
            let n = self.correct_predictions as f64;
            self.avg_score_when_correct += (magnitude - self.avg_score_when_correct) / n;
            self.avg_confidence_when_correct += (confidence - self.avg_confidence_when_correct) / n;
        } else {
            let n = self.wrong_predictions() as f64;
            self.avg_score_when_wrong += (magnitude - self.avg_score_when_wrong) / n;
            self.avg_confidence_when_wrong += (confidence - self.avg_confidence_when_wrong) / n;
        }

        if self.correct_predictions > 0 && self.wrong_predictions() > 0 {
            self.optimal_score_threshold =
                Some((self.avg_score_when_correct + self.avg_score_when_wrong) / 2.0);
            self.optimal_confidence_threshold =
                Some((self.avg_confidence_when_correct + self.avg_confidence_when_wrong) / 2.0);
        }

        // NaN or negative bounds collapse to zero
        let bound = params.max_adjustment.max(0.0);
        self.weight_adjustment =
            (params.gain * (self.rolling_accuracy - 0.5)).clamp(-bound, bound);
        self.updated_at = now;
    }
}

/// Calibrator configuration
#[derive(Debug, Clone)]
pub struct CalibratorConfig {
    pub params: LearningParams,
    /// Minimum weight any layer keeps after renormalization
    pub weight_floor: f64,
    /// Dead band for a layer's own call
    pub layer_neutral_band: f64,
    /// Predictions consumed per run
    pub batch_size: usize,
}

impl Default for CalibratorConfig {
    fn default() -> Self {
        Self {
            params: LearningParams::default(),
            weight_floor: 0.05,
            layer_neutral_band: 10.0,
            batch_size: 500,
        }
    }
}

/// Result of one `recalibrate` run
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationReport {
    /// Predictions consumed in this run
    pub processed: usize,
    /// Predictions another run had already consumed
    pub already_consumed: usize,
    /// History rows updated (one per available layer per prediction)
    pub layer_updates: usize,
    /// Mean adjustment applied per layer
    pub adjustments: HashMap<Layer, f64>,
    /// Layers held at the weight floor
    pub pinned: Vec<Layer>,
    /// Weight version in force after the run
    pub weights: WeightRecord,
}

pub struct WeightCalibrator {
    ledger: Arc<Ledger>,
    config: CalibratorConfig,
}

impl WeightCalibrator {
    pub fn new(ledger: Arc<Ledger>, config: CalibratorConfig) -> Self {
        Self { ledger, config }
    }

    /// Consume resolved, not-yet-learned predictions and publish new weights.
    ///
    /// The claim on each prediction, its history upserts and the new weight
    /// version commit in one transaction, so re-running after a crash or in
    /// parallel never counts an outcome twice.
    pub fn recalibrate(&self, now: DateTime<Utc>) -> EngineResult<CalibrationReport> {
        let candidates = self.ledger.unlearned_predictions(self.config.batch_size)?;
        if candidates.is_empty() {
            debug!("No resolved predictions awaiting calibration");
            return Ok(CalibrationReport {
                processed: 0,
                already_consumed: 0,
                layer_updates: 0,
                adjustments: HashMap::new(),
                pinned: Vec::new(),
                weights: self.ledger.latest_weights()?,
            });
        }

        let config = &self.config;
        let report = self.ledger.transaction(|tx| {
            let mut processed = 0;
            let mut already_consumed = 0;
            let mut layer_updates = 0;
            // Latest adjustment of each touched row
            let mut touched: BTreeMap<HistoryKey, f64> = BTreeMap::new();

            for prediction in &candidates {
                let Some(outcome) = prediction.outcome.as_ref() else {
                    warn!(
                        prediction_id = prediction.id,
                        "Resolved prediction has no outcome, skipping"
                    );
                    continue;
                };
                if !tx.claim_learning(prediction.id, now)? {
                    info!(prediction_id = prediction.id, "Outcome already consumed by calibrator");
                    already_consumed += 1;
                    continue;
                }

                for (layer, reading) in prediction.layer_breakdown.iter() {
                    if !reading.available {
                        continue;
                    }
                    let key = HistoryKey {
                        layer,
                        regime: prediction.regime,
                        horizon_days: prediction.horizon_days,
                        symbol: prediction.symbol.clone(),
                    };
                    let mut history = match tx.load_history(&key)? {
                        Some(h) => h,
                        None => {
                            LayerLearningHistory::new(key.clone(), config.params.decay_factor, now)
                        }
                    };
                    let call = Direction::from_score(reading.score, config.layer_neutral_band);
                    let correct = call == outcome.actual_direction;
                    history.record(correct, reading.score, reading.confidence, &config.params, now);
                    tx.save_history(&history)?;

                    touched.insert(key, history.weight_adjustment);
                    layer_updates += 1;
                }
                processed += 1;
            }

            let current = tx.latest_weights()?;
            if touched.is_empty() {
                return Ok(CalibrationReport {
                    processed,
                    already_consumed,
                    layer_updates,
                    adjustments: HashMap::new(),
                    pinned: Vec::new(),
                    weights: current,
                });
            }

            let mut sums: HashMap<Layer, (f64, usize)> = HashMap::new();
            for (key, adj) in &touched {
                let entry = sums.entry(key.layer).or_insert((0.0, 0));
                entry.0 += adj;
                entry.1 += 1;
            }
            let adjustments: HashMap<Layer, f64> = sums
                .into_iter()
                .map(|(layer, (sum, n))| (layer, sum / n as f64))
                .collect();

            let (next, pinned) = current
                .weights
                .apply_adjustments(&adjustments, config.weight_floor);
            if !pinned.is_empty() {
                warn!(
                    pinned = ?pinned,
                    floor = config.weight_floor,
                    "Weight floor reached, remainder redistributed"
                );
            }

            let reason = format!("calibration batch of {} predictions", processed);
            let record = tx.insert_weights(&next, &reason, now)?;
            Ok(CalibrationReport {
                processed,
                already_consumed,
                layer_updates,
                adjustments,
                pinned,
                weights: record,
            })
        })?;

        info!(
            processed = report.processed,
            already_consumed = report.already_consumed,
            layer_updates = report.layer_updates,
            weights_version = report.weights.version,
            hard_data = report.weights.weights.hard_data,
            technical = report.weights.weights.technical,
            behavioral = report.weights.weights.behavioral,
            economic = report.weights.weights.economic,
            "Calibration complete"
        );
        Ok(report)
    }
}
