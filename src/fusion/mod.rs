//! Signal Fusion
//!
//! Combines the four layer readings, the versioned weight vector and the
//! session prior into one `CombinedSignal`. `SignalFuser::fuse` is pure;
//! `FusionService` wraps it with scoring, session lookup and the ledger write.

pub mod weights;

pub use weights::{LayerWeights, WeightRecord};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::calibration::LayerLearningHistory;
use crate::error::EngineResult;
use crate::ledger::prices::PriceSource;
use crate::ledger::Ledger;
use crate::persistence::{CsvPersistence, PriceRecord};
use crate::scorers::{EvidenceFeed, ScorerSet};
use crate::session::{MarketCalendar, SessionClassifier, SessionProfile, SessionState};
use crate::types::{
    Direction, KeyFactors, Layer, LayerScores, MarketPrediction, PredictionStatus, Regime,
    SignalAction,
};

/// Layers below this confidence are listed as uncertainty
const LOW_CONFIDENCE: f64 = 30.0;

/// Fuser configuration
#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// Confidence (after session multiplier) required to trade
    pub trade_confidence_threshold: f64,
    /// |composite| above this is a STRONG call
    pub strong_score_threshold: f64,
    pub stop_loss_vol_multiple: f64,
    pub take_profit_vol_multiple: f64,
    /// Accuracy volatility assumed for a layer with no history
    pub default_accuracy_volatility: f64,
    /// Dead band for a single layer's own directional call
    pub layer_neutral_band: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            trade_confidence_threshold: 60.0,
            strong_score_threshold: 30.0,
            stop_loss_vol_multiple: 1.5,
            take_profit_vol_multiple: 2.5,
            default_accuracy_volatility: 0.25,
            layer_neutral_band: 10.0,
        }
    }
}

/// Per-run identifiers that do not influence the arithmetic
#[derive(Debug, Clone)]
pub struct FusionContext {
    pub symbol: String,
    pub horizon_days: u32,
    pub regime: Regime,
    pub weights_version: i64,
    pub generated_at: DateTime<Utc>,
}

/// Calibration state of one layer at the current (regime, horizon)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerAccuracy {
    pub rolling_accuracy: f64,
    pub accuracy_volatility: f64,
    pub total_predictions: u64,
}

/// Read-only slice of learning history handed to the fuser
#[derive(Debug, Clone, Default)]
pub struct CalibrationView {
    layers: HashMap<Layer, LayerAccuracy>,
}

impl CalibrationView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_histories(histories: &[LayerLearningHistory]) -> Self {
        let mut view = Self::new();
        for h in histories {
            view.insert(
                h.layer,
                LayerAccuracy {
                    rolling_accuracy: h.rolling_accuracy,
                    accuracy_volatility: h.accuracy_volatility(),
                    total_predictions: h.total_predictions,
                },
            );
        }
        view
    }

    pub fn insert(&mut self, layer: Layer, accuracy: LayerAccuracy) {
        self.layers.insert(layer, accuracy);
    }

    pub fn get(&self, layer: Layer) -> Option<&LayerAccuracy> {
        self.layers
            .get(&layer)
            .filter(|a| a.total_predictions > 0)
    }
}

/// Trade recommendation attached to a signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeAction {
    pub should_trade: bool,
    pub position_size_multiplier: f64,
    pub stop_loss_percent: f64,
    pub take_profit_percent: f64,
}

/// Fused directional call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedSignal {
    pub symbol: String,
    pub generated_at: DateTime<Utc>,
    pub horizon_days: u32,
    /// Weighted composite in [-100, 100]
    pub composite_score: f64,
    /// Weighted layer confidence before the session multiplier
    pub raw_confidence: f64,
    /// Final confidence in [0, 100]
    pub confidence: f64,
    pub action: SignalAction,
    pub direction: Direction,
    pub direction_probability: f64,
    /// Rolling accuracy of the dominant layer; `None` without history
    pub expected_accuracy: Option<f64>,
    pub dominant_layer: Option<Layer>,
    pub regime: Regime,
    pub session: SessionState,
    pub session_multiplier: f64,
    /// Layer readings with the weights actually applied
    pub layers: LayerScores,
    pub weights_version: i64,
    pub key_factors: KeyFactors,
    pub trade: TradeAction,
}

impl CombinedSignal {
    pub fn target_date(&self) -> DateTime<Utc> {
        self.generated_at + Duration::days(self.horizon_days as i64)
    }

    /// Pending ledger row for this signal
    pub fn to_prediction(&self, price_at_prediction: f64) -> MarketPrediction {
        MarketPrediction {
            id: 0,
            symbol: self.symbol.clone(),
            prediction_date: self.generated_at,
            horizon_days: self.horizon_days,
            target_date: self.target_date(),
            direction: self.direction,
            action: self.action,
            direction_probability: self.direction_probability,
            confidence: self.confidence,
            price_at_prediction,
            regime: self.regime,
            session: self.session,
            layer_breakdown: self.layers.clone(),
            weights_version: self.weights_version,
            key_factors: self.key_factors.clone(),
            status: PredictionStatus::Pending,
            outcome: None,
            learning_processed_at: None,
            pattern_processed_at: None,
        }
    }
}

/// Pure weighted fusion
#[derive(Debug, Clone, Default)]
pub struct SignalFuser {
    config: FusionConfig,
}

impl SignalFuser {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn fuse(
        &self,
        scores: &LayerScores,
        weights: &LayerWeights,
        session: &SessionProfile,
        ctx: &FusionContext,
        calibration: &CalibrationView,
    ) -> CombinedSignal {
        let available: Vec<Layer> = scores
            .iter()
            .filter(|(_, s)| s.available)
            .map(|(layer, _)| layer)
            .collect();
        // Missing feeds drop out of this run only
        let applied = weights.normalized_over(&available);

        let mut layers = scores.clone();
        let mut composite = 0.0;
        let mut raw_confidence = 0.0;
        let mut dominant: Option<(Layer, f64)> = None;

        for layer in Layer::ALL {
            let w = applied.get(layer);
            let reading = layers.get_mut(layer);
            reading.weight = w;
            if !reading.available {
                continue;
            }

            let contribution = reading.score * w;
            composite += contribution;
            raw_confidence += reading.confidence * w;

            let magnitude = contribution.abs();
            if dominant.map_or(true, |(_, best)| magnitude > best) {
                dominant = Some((layer, magnitude));
            }
        }

        let composite = composite.clamp(-100.0, 100.0);
        let confidence = (raw_confidence * session.signal_multiplier).clamp(0.0, 100.0);
        let action = SignalAction::from_score(composite, self.config.strong_score_threshold);
        let direction = action.direction();
        let dominant_layer = dominant.map(|(layer, _)| layer);

        let dominant_accuracy = dominant_layer.and_then(|l| calibration.get(l));
        let expected_accuracy = dominant_accuracy.map(|a| a.rolling_accuracy);
        let volatility = dominant_accuracy
            .map(|a| a.accuracy_volatility)
            .unwrap_or(self.config.default_accuracy_volatility);

        let trade = TradeAction {
            should_trade: confidence > self.config.trade_confidence_threshold
                && session.is_optimal_trading,
            position_size_multiplier: (confidence / 100.0) / (1.0 + 2.0 * volatility),
            stop_loss_percent: session.avg_volatility * self.config.stop_loss_vol_multiple,
            take_profit_percent: session.avg_volatility * self.config.take_profit_vol_multiple,
        };

        let key_factors = self.key_factors(&layers, session);

        CombinedSignal {
            symbol: ctx.symbol.clone(),
            generated_at: ctx.generated_at,
            horizon_days: ctx.horizon_days,
            composite_score: composite,
            raw_confidence,
            confidence,
            action,
            direction,
            direction_probability: 0.5 + composite.abs() / 200.0,
            expected_accuracy,
            dominant_layer,
            regime: ctx.regime,
            session: session.state,
            session_multiplier: session.signal_multiplier,
            layers,
            weights_version: ctx.weights_version,
            key_factors,
            trade,
        }
    }

    fn key_factors(&self, layers: &LayerScores, session: &SessionProfile) -> KeyFactors {
        let band = self.config.layer_neutral_band;
        let mut factors = KeyFactors::default();

        for (layer, reading) in layers.iter() {
            if !reading.available {
                factors.uncertainty.push(format!("{}: no data", layer));
                continue;
            }
            let lead = reading
                .signals
                .first()
                .map(|s| format!("{}: {}", layer, s))
                .unwrap_or_else(|| format!("{}: score {:+.1}", layer, reading.score));

            match Direction::from_score(reading.score, band) {
                Direction::Up => factors.bullish.push(lead),
                Direction::Down => factors.bearish.push(lead),
                Direction::Neutral => {}
            }
            if reading.confidence < LOW_CONFIDENCE {
                factors
                    .uncertainty
                    .push(format!("{}: low confidence ({:.0})", layer, reading.confidence));
            }
        }

        if !session.is_optimal_trading {
            factors
                .uncertainty
                .push(format!("session {} is not an optimal trading window", session.state));
        }
        factors
    }
}

/// Score, classify, fuse and persist one (symbol, horizon) call
pub struct FusionService {
    ledger: Arc<Ledger>,
    feed: Arc<dyn EvidenceFeed>,
    prices: Arc<dyn PriceSource>,
    calendar: Arc<dyn MarketCalendar>,
    scorers: ScorerSet,
    fuser: SignalFuser,
    min_prior_samples: u64,
    /// Reference prices are appended here when set
    price_log: Option<(Arc<CsvPersistence>, String)>,
}

impl FusionService {
    pub fn new(
        ledger: Arc<Ledger>,
        feed: Arc<dyn EvidenceFeed>,
        prices: Arc<dyn PriceSource>,
        calendar: Arc<dyn MarketCalendar>,
        scorers: ScorerSet,
        fuser: SignalFuser,
        min_prior_samples: u64,
    ) -> Self {
        Self {
            ledger,
            feed,
            prices,
            calendar,
            scorers,
            fuser,
            min_prior_samples,
            price_log: None,
        }
    }

    /// Append every reference price to the daily price CSVs under `source`
    pub fn with_price_log(mut self, persistence: Arc<CsvPersistence>, source: &str) -> Self {
        self.price_log = Some((persistence, source.to_string()));
        self
    }

    /// Returns `None` when no reference price exists; nothing is written then.
    pub async fn run_once(
        &self,
        symbol: &str,
        horizon_days: u32,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<CombinedSignal>> {
        let price = match self.prices.price_at(symbol, now).await {
            Ok(Some(p)) if p > 0.0 => p,
            Ok(_) => {
                warn!(symbol = %symbol, "No reference price, skipping fusion run");
                return Ok(None);
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Price lookup failed, skipping fusion run");
                return Ok(None);
            }
        };

        if let Some((persistence, source)) = &self.price_log {
            if let Err(e) = persistence
                .save_price(PriceRecord::new(symbol, now, price, source))
                .await
            {
                warn!(symbol = %symbol, error = %e, "Failed to record reference price");
            }
        }

        let scores = self.scorers.score_symbol(self.feed.as_ref(), symbol, now).await;
        let regime = Regime::from_layers(&scores);

        let priors = self.ledger.session_priors()?;
        let classifier = SessionClassifier::new(self.min_prior_samples).with_priors(priors);
        let session = classifier.profile_at(now, Some(self.calendar.as_ref()));

        // Latest version at call time; calibrator swaps in whole new records
        let weights = self.ledger.latest_weights()?;
        let histories = self.ledger.learning_histories(symbol, regime, horizon_days)?;
        let calibration = CalibrationView::from_histories(&histories);

        let ctx = FusionContext {
            symbol: symbol.to_string(),
            horizon_days,
            regime,
            weights_version: weights.version,
            generated_at: now,
        };
        let signal = self
            .fuser
            .fuse(&scores, &weights.weights, &session, &ctx, &calibration);

        let prediction = signal.to_prediction(price);
        let signal_json = serde_json::to_string(&signal)?;
        let id = self.ledger.append_prediction(&prediction, Some(&signal_json))?;

        info!(
            prediction_id = id,
            symbol = %symbol,
            horizon_days,
            action = %signal.action,
            composite = signal.composite_score,
            confidence = signal.confidence,
            session = %signal.session,
            regime = %regime,
            should_trade = signal.trade.should_trade,
            "Fused signal recorded"
        );
        debug!(symbol = %symbol, factors = ?signal.key_factors, "Key factors");

        Ok(Some(signal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LayerScore;

    fn scores(h: f64, t: f64, b: f64, e: f64) -> LayerScores {
        LayerScores {
            hard_data: LayerScore::new(h, 80.0, vec!["order flow".into()]),
            technical: LayerScore::new(t, 70.0, vec!["rsi".into()]),
            behavioral: LayerScore::new(b, 60.0, vec![]),
            economic: LayerScore::new(e, 50.0, vec![]),
        }
    }

    fn ctx() -> FusionContext {
        FusionContext {
            symbol: "SPY".into(),
            horizon_days: 5,
            regime: Regime::Neutral,
            weights_version: 1,
            generated_at: DateTime::from_timestamp(1_760_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_composite_uses_renormalized_weights() {
        let fuser = SignalFuser::default();
        let raw = LayerWeights::new(0.70, 0.50, 0.40, 0.40); // sums to 2.0
        let session = SessionState::NyMidday.static_prior();
        let view = CalibrationView::new();
        let s = fuser.fuse(&scores(50.0, 20.0, 0.0, -10.0), &raw, &session, &ctx(), &view);

        let expected = 50.0 * 0.35 + 20.0 * 0.25 + 0.0 * 0.20 - 10.0 * 0.20;
        assert!((s.composite_score - expected).abs() < 1e-9);
        let applied: f64 = s.layers.iter().map(|(_, l)| l.weight).sum();
        assert!((applied - 1.0).abs() < 1e-9);
        assert_eq!(s.action, SignalAction::Buy);
        assert_eq!(s.direction, Direction::Up);
        assert_eq!(s.dominant_layer, Some(Layer::HardData));
    }

    #[test]
    fn test_missing_layer_excluded_for_run() {
        let fuser = SignalFuser::default();
        let mut input = scores(40.0, 40.0, 40.0, 40.0);
        input.economic = LayerScore::unavailable("feed stale");
        let s = fuser.fuse(
            &input,
            &LayerWeights::default(),
            &SessionState::NyMidday.static_prior(),
            &ctx(),
            &CalibrationView::new(),
        );
        assert_eq!(s.layers.economic.weight, 0.0);
        assert!((s.composite_score - 40.0).abs() < 1e-9);
        assert!(s.key_factors.uncertainty.iter().any(|u| u.starts_with("economic")));
    }

    #[test]
    fn test_all_layers_missing_is_neutral() {
        let fuser = SignalFuser::default();
        let input = LayerScores {
            hard_data: LayerScore::unavailable("x"),
            technical: LayerScore::unavailable("x"),
            behavioral: LayerScore::unavailable("x"),
            economic: LayerScore::unavailable("x"),
        };
        let s = fuser.fuse(
            &input,
            &LayerWeights::default(),
            &SessionState::NyAmPowerHour.static_prior(),
            &ctx(),
            &CalibrationView::new(),
        );
        assert_eq!(s.action, SignalAction::Neutral);
        assert_eq!(s.confidence, 0.0);
        assert_eq!(s.dominant_layer, None);
        assert!(!s.trade.should_trade);
    }

    #[test]
    fn test_fuse_is_deterministic() {
        let fuser = SignalFuser::default();
        let input = scores(63.3, -12.7, 8.1, 33.3);
        let session = SessionState::LondonOpen.static_prior();
        let (weights, view) = (LayerWeights::default(), CalibrationView::new());
        let a = fuser.fuse(&input, &weights, &session, &ctx(), &view);
        let b = fuser.fuse(&input, &weights, &session, &ctx(), &view);
        assert_eq!(a, b);
        assert_eq!(a.composite_score.to_bits(), b.composite_score.to_bits());
    }

    #[test]
    fn test_session_multiplier_gates_trading() {
        let fuser = SignalFuser::default();
        let input = scores(60.0, 50.0, 40.0, 30.0);
        let power = fuser.fuse(
            &input,
            &LayerWeights::default(),
            &SessionState::NyAmPowerHour.static_prior(),
            &ctx(),
            &CalibrationView::new(),
        );
        let closed = fuser.fuse(
            &input,
            &LayerWeights::default(),
            &SessionState::Closed.static_prior(),
            &ctx(),
            &CalibrationView::new(),
        );
        assert!(power.confidence > closed.confidence);
        assert!(power.trade.should_trade);
        assert!(!closed.trade.should_trade);
    }

    #[test]
    fn test_expected_accuracy_from_dominant_layer() {
        let fuser = SignalFuser::default();
        let mut view = CalibrationView::new();
        view.insert(
            Layer::Technical,
            LayerAccuracy {
                rolling_accuracy: 0.72,
                accuracy_volatility: 0.1,
                total_predictions: 40,
            },
        );
        let session = SessionState::NyAmPowerHour.static_prior();
        let weights = LayerWeights::default();

        let s = fuser.fuse(&scores(5.0, 90.0, 0.0, 0.0), &weights, &session, &ctx(), &view);
        assert_eq!(s.dominant_layer, Some(Layer::Technical));
        assert_eq!(s.expected_accuracy, Some(0.72));
        let expected_size = (s.confidence / 100.0) / 1.2;
        assert!((s.trade.position_size_multiplier - expected_size).abs() < 1e-12);

        // No history for the dominant layer -> no expected accuracy
        let s = fuser.fuse(&scores(90.0, 5.0, 0.0, 0.0), &weights, &session, &ctx(), &view);
        assert_eq!(s.expected_accuracy, None);
    }

    #[test]
    fn test_stop_and_target_follow_session_volatility() {
        let fuser = SignalFuser::default();
        let session = SessionState::NyAmPowerHour.static_prior();
        let (weights, view) = (LayerWeights::default(), CalibrationView::new());
        let s = fuser.fuse(&scores(10.0, 10.0, 10.0, 10.0), &weights, &session, &ctx(), &view);
        assert!((s.trade.stop_loss_percent - 1.6 * 1.5).abs() < 1e-12);
        assert!((s.trade.take_profit_percent - 1.6 * 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_to_prediction_sets_target_date() {
        let fuser = SignalFuser::default();
        let s = fuser.fuse(
            &scores(-45.0, -20.0, 0.0, 0.0),
            &LayerWeights::default(),
            &SessionState::NyMidday.static_prior(),
            &ctx(),
            &CalibrationView::new(),
        );
        let p = s.to_prediction(512.3);
        assert_eq!(p.status, PredictionStatus::Pending);
        assert_eq!(p.direction, Direction::Down);
        assert_eq!(p.target_date - p.prediction_date, Duration::days(5));
        assert!((p.direction_probability - (0.5 + s.composite_score.abs() / 200.0)).abs() < 1e-12);
    }
}
