//! Pattern Detector
//!
//! Mines resolved predictions for recurring condition combinations
//! ("3 layers agree and confidence >= 70") and tracks how often each one
//! ended up right. Updates are incremental: each resolution is folded in
//! exactly once, guarded by `pattern_processed_at`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::EngineResult;
use crate::ledger::Ledger;
use crate::session::SessionState;
use crate::types::{MarketPrediction, PredictionStatus, Regime};

/// Confidence buckets, highest first
const CONFIDENCE_FLOORS: [f64; 3] = [70.0, 50.0, 0.0];
/// Agreement counts above this share the top floor
const MAX_AGREEMENT_BUCKET: usize = 3;

/// Parameterized rule a prediction either satisfies or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternConditions {
    pub min_layer_agreement: usize,
    pub min_confidence: f64,
    pub regime: Option<Regime>,
    pub horizon_days: Option<u32>,
    pub session: Option<SessionState>,
}

impl PatternConditions {
    /// Stable key of the rule
    pub fn signature(&self) -> String {
        let mut sig = format!(
            "agree>={}|conf>={:.0}",
            self.min_layer_agreement, self.min_confidence
        );
        if let Some(regime) = self.regime {
            let _ = write!(sig, "|regime={}", regime);
        }
        if let Some(h) = self.horizon_days {
            let _ = write!(sig, "|h={}d", h);
        }
        if let Some(session) = self.session {
            let _ = write!(sig, "|session={}", session);
        }
        sig
    }

    pub fn name(&self) -> String {
        let mut name = format!(
            "{}+ layers agree, confidence >= {:.0}%",
            self.min_layer_agreement, self.min_confidence
        );
        if let Some(regime) = self.regime {
            let _ = write!(name, ", {}", regime);
        }
        if let Some(h) = self.horizon_days {
            let _ = write!(name, ", {}d horizon", h);
        }
        if let Some(session) = self.session {
            let _ = write!(name, ", during {}", session);
        }
        name
    }

    pub fn matches(&self, prediction: &MarketPrediction, band: f64) -> bool {
        prediction.layer_agreement(band) >= self.min_layer_agreement
            && prediction.confidence >= self.min_confidence
            && self.regime.map_or(true, |r| r == prediction.regime)
            && self.horizon_days.map_or(true, |h| h == prediction.horizon_days)
            && self.session.map_or(true, |s| s == prediction.session)
    }

    /// Every rule a resolved prediction satisfies: each agreement floor and
    /// each confidence floor it reaches, crossed with the plain,
    /// (regime, horizon) and (regime, horizon, session) variants.
    pub fn for_prediction(prediction: &MarketPrediction, band: f64) -> Vec<PatternConditions> {
        let agreement = prediction.layer_agreement(band).min(MAX_AGREEMENT_BUCKET);
        let agreement_floors: Vec<usize> = (0..=agreement).rev().collect();
        let confidence_floors = CONFIDENCE_FLOORS
            .iter()
            .copied()
            .filter(|floor| prediction.confidence >= *floor);

        let mut rules = Vec::new();
        for min_confidence in confidence_floors {
            for &min_layer_agreement in &agreement_floors {
                let base = PatternConditions {
                    min_layer_agreement,
                    min_confidence,
                    regime: None,
                    horizon_days: None,
                    session: None,
                };
                let contextual = PatternConditions {
                    regime: Some(prediction.regime),
                    horizon_days: Some(prediction.horizon_days),
                    ..base.clone()
                };
                let with_session = PatternConditions {
                    session: Some(prediction.session),
                    ..contextual.clone()
                };
                rules.extend([base, contextual, with_session]);
            }
        }
        rules
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionPattern {
    pub signature: String,
    pub name: String,
    pub conditions: PatternConditions,
    pub occurrences: u64,
    pub successes: u64,
    pub success_rate: f64,
    /// Mean realized return signed by the predicted direction (percent)
    pub avg_return: f64,
    /// True once `occurrences >= min_occurrences_required`
    pub is_active: bool,
    pub min_occurrences_required: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl PredictionPattern {
    pub fn new(
        conditions: PatternConditions,
        min_occurrences_required: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            signature: conditions.signature(),
            name: conditions.name(),
            conditions,
            occurrences: 0,
            successes: 0,
            success_rate: 0.0,
            avg_return: 0.0,
            is_active: false,
            min_occurrences_required,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Fold one resolved prediction in. Counts only grow.
    pub fn record(&mut self, success: bool, directional_return: f64, now: DateTime<Utc>) {
        self.occurrences += 1;
        if success {
            self.successes += 1;
        }
        let n = self.occurrences as f64;
        self.success_rate = self.successes as f64 / n;
        self.avg_return += (directional_return - self.avg_return) / n;
        self.is_active = self.occurrences >= self.min_occurrences_required;
        self.last_seen = now;
    }
}

#[derive(Debug, Clone)]
pub struct PatternConfig {
    pub min_occurrences_required: u64,
    /// Dead band for a layer's own call when counting agreement
    pub layer_neutral_band: f64,
    pub batch_size: usize,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            min_occurrences_required: 10,
            layer_neutral_band: 10.0,
            batch_size: 500,
        }
    }
}

/// Result of one `detect_patterns` run
#[derive(Debug, Clone, Default, Serialize)]
pub struct PatternReport {
    pub processed: usize,
    pub already_consumed: usize,
    /// Current state of every pattern touched in the run
    pub patterns: Vec<PredictionPattern>,
    /// Signatures that crossed the activation threshold in this run
    pub newly_active: Vec<String>,
}

pub struct PatternDetector {
    ledger: Arc<Ledger>,
    config: PatternConfig,
}

impl PatternDetector {
    pub fn new(ledger: Arc<Ledger>, config: PatternConfig) -> Self {
        Self { ledger, config }
    }

    /// Fold newly resolved predictions into their patterns
    pub fn detect_patterns(&self, now: DateTime<Utc>) -> EngineResult<PatternReport> {
        let candidates = self.ledger.unpatterned_predictions(self.config.batch_size)?;
        if candidates.is_empty() {
            debug!("No resolved predictions awaiting pattern detection");
            return Ok(PatternReport::default());
        }

        let config = &self.config;
        let report = self.ledger.transaction(|tx| {
            let mut report = PatternReport::default();
            let mut touched: BTreeMap<String, PredictionPattern> = BTreeMap::new();

            for prediction in &candidates {
                let Some(directional_return) = prediction.directional_return() else {
                    warn!(
                        prediction_id = prediction.id,
                        "Resolved prediction has no outcome, skipping"
                    );
                    continue;
                };
                if !tx.claim_pattern(prediction.id, now)? {
                    info!(
                        prediction_id = prediction.id,
                        "Outcome already consumed by pattern detector"
                    );
                    report.already_consumed += 1;
                    continue;
                }

                let success = prediction.status == PredictionStatus::Correct;
                let band = config.layer_neutral_band;
                let rules = PatternConditions::for_prediction(prediction, band);
                for conditions in rules {
                    let signature = conditions.signature();
                    let mut pattern = match touched.remove(&signature) {
                        Some(p) => p,
                        None => match tx.load_pattern(&signature)? {
                            Some(p) => p,
                            None => PredictionPattern::new(
                                conditions,
                                config.min_occurrences_required,
                                now,
                            ),
                        },
                    };
                    let was_active = pattern.is_active;
                    pattern.record(success, directional_return, now);
                    if pattern.is_active && !was_active {
                        report.newly_active.push(signature.clone());
                    }
                    tx.save_pattern(&pattern)?;
                    touched.insert(signature, pattern);
                }
                report.processed += 1;
            }

            report.patterns = touched.into_values().collect();
            Ok(report)
        })?;

        for signature in &report.newly_active {
            info!(pattern = %signature, "Pattern reached minimum sample and is now active");
        }
        info!(
            processed = report.processed,
            already_consumed = report.already_consumed,
            patterns = report.patterns.len(),
            "Pattern detection complete"
        );
        Ok(report)
    }
}
