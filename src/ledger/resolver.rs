//! Outcome Resolver
//!
//! The only writer of `outcome` / `status`. Scans pending predictions whose
//! target date has passed, looks up the realized price with a bounded
//! retry, and either scores the call or, once the grace window is over,
//! expires it.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::prices::PriceSource;
use super::Ledger;
use crate::error::{EngineError, EngineResult};
use crate::types::{Direction, MarketPrediction, PredictionOutcome, PredictionStatus};

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// |return| at or below this (percent) is a neutral move
    pub neutral_return_threshold_pct: f64,
    /// Price lookups per prediction per run
    pub max_attempts: u32,
    pub retry_backoff: std::time::Duration,
    /// How long after the target date a missing price is tolerated
    pub expiry_grace: Duration,
    /// Due predictions handled per run
    pub batch_size: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            neutral_return_threshold_pct: 1.0,
            max_attempts: 3,
            retry_backoff: std::time::Duration::from_millis(500),
            expiry_grace: Duration::days(3),
            batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolveResult {
    Resolved {
        status: PredictionStatus,
        outcome: PredictionOutcome,
    },
    /// Not due yet, or price missing inside the grace window
    StillPending,
    Expired,
    /// Another run got there first
    AlreadyResolved,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolveReport {
    pub due: usize,
    pub correct: usize,
    pub incorrect: usize,
    pub expired: usize,
    pub still_pending: usize,
    pub already_resolved: usize,
}

/// Score a prediction against the realized price. `None` for a bad reference price.
pub fn evaluate_outcome(
    prediction: &MarketPrediction,
    price_at_target: f64,
    neutral_threshold_pct: f64,
    resolved_at: DateTime<Utc>,
) -> Option<PredictionOutcome> {
    let base = prediction.price_at_prediction;
    if !(base.is_finite() && base > 0.0 && price_at_target.is_finite()) {
        return None;
    }
    let actual_return_pct = (price_at_target - base) / base * 100.0;
    let actual_direction = Direction::from_return(actual_return_pct, neutral_threshold_pct);
    Some(PredictionOutcome {
        price_at_target,
        actual_return_pct,
        actual_direction,
        prediction_correct: actual_direction == prediction.direction,
        resolved_at,
    })
}

pub struct OutcomeResolver {
    ledger: Arc<Ledger>,
    prices: Arc<dyn PriceSource>,
    config: ResolverConfig,
}

impl OutcomeResolver {
    pub fn new(ledger: Arc<Ledger>, prices: Arc<dyn PriceSource>, config: ResolverConfig) -> Self {
        Self {
            ledger,
            prices,
            config,
        }
    }

    /// Resolve one prediction. Re-running on a resolved row is a no-op.
    pub async fn resolve(
        &self,
        prediction: &MarketPrediction,
        now: DateTime<Utc>,
    ) -> EngineResult<ResolveResult> {
        if prediction.status != PredictionStatus::Pending {
            info!(
                prediction_id = prediction.id,
                status = %prediction.status,
                "Prediction already resolved"
            );
            return Ok(ResolveResult::AlreadyResolved);
        }
        if now < prediction.target_date {
            return Ok(ResolveResult::StillPending);
        }

        let price = self
            .lookup_with_retry(&prediction.symbol, prediction.target_date)
            .await;

        let outcome = price.and_then(|p| {
            evaluate_outcome(prediction, p, self.config.neutral_return_threshold_pct, now)
        });

        match outcome {
            Some(outcome) => {
                let status = if outcome.prediction_correct {
                    PredictionStatus::Correct
                } else {
                    PredictionStatus::Incorrect
                };
                if !self.ledger.record_outcome(prediction.id, &outcome, status)? {
                    info!(prediction_id = prediction.id, "Outcome already written by another run");
                    return Ok(ResolveResult::AlreadyResolved);
                }
                info!(
                    prediction_id = prediction.id,
                    symbol = %prediction.symbol,
                    predicted = %prediction.direction,
                    actual = %outcome.actual_direction,
                    return_pct = outcome.actual_return_pct,
                    status = %status,
                    "Prediction resolved"
                );
                Ok(ResolveResult::Resolved { status, outcome })
            }
            None if now >= prediction.target_date + self.config.expiry_grace => {
                let err = EngineError::PriceUnavailable {
                    symbol: prediction.symbol.clone(),
                    at: prediction.target_date,
                };
                if !self.ledger.mark_expired(prediction.id)? {
                    info!(prediction_id = prediction.id, "Outcome already written by another run");
                    return Ok(ResolveResult::AlreadyResolved);
                }
                warn!(prediction_id = prediction.id, "{}, prediction expired", err);
                Ok(ResolveResult::Expired)
            }
            None => {
                debug!(
                    prediction_id = prediction.id,
                    symbol = %prediction.symbol,
                    "Realized price not available yet, retrying next run"
                );
                Ok(ResolveResult::StillPending)
            }
        }
    }

    /// Resolve every due prediction; storage failures abort the run
    pub async fn resolve_due(&self, now: DateTime<Utc>) -> EngineResult<ResolveReport> {
        let due = self.ledger.due_predictions(now, self.config.batch_size)?;
        let mut report = ResolveReport {
            due: due.len(),
            ..Default::default()
        };

        for prediction in &due {
            match self.resolve(prediction, now).await? {
                ResolveResult::Resolved {
                    status: PredictionStatus::Correct,
                    ..
                } => report.correct += 1,
                ResolveResult::Resolved { .. } => report.incorrect += 1,
                ResolveResult::Expired => report.expired += 1,
                ResolveResult::StillPending => report.still_pending += 1,
                ResolveResult::AlreadyResolved => report.already_resolved += 1,
            }
        }

        if report.due > 0 {
            info!(
                due = report.due,
                correct = report.correct,
                incorrect = report.incorrect,
                expired = report.expired,
                still_pending = report.still_pending,
                "Resolution run complete"
            );
        }
        Ok(report)
    }

    async fn lookup_with_retry(&self, symbol: &str, at: DateTime<Utc>) -> Option<f64> {
        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.prices.price_at(symbol, at).await {
                Ok(Some(price)) if price.is_finite() && price > 0.0 => return Some(price),
                Ok(_) => debug!(symbol = %symbol, attempt, "No realized price"),
                Err(e) => warn!(symbol = %symbol, attempt, error = %e, "Price lookup failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_backoff).await;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::prices::MockPriceSource;
    use crate::session::SessionState;
    use crate::types::{KeyFactors, LayerScore, LayerScores, Regime, SignalAction};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 5, 14, 0, 0).unwrap()
    }

    fn pending(direction: Direction) -> MarketPrediction {
        let action = match direction {
            Direction::Up => SignalAction::Buy,
            Direction::Down => SignalAction::Sell,
            Direction::Neutral => SignalAction::Neutral,
        };
        MarketPrediction {
            id: 0,
            symbol: "SPY".into(),
            prediction_date: t0(),
            horizon_days: 1,
            target_date: t0() + Duration::days(1),
            direction,
            action,
            direction_probability: 0.6,
            confidence: 70.0,
            price_at_prediction: 100.0,
            regime: Regime::Neutral,
            session: SessionState::NyAmPowerHour,
            layer_breakdown: LayerScores {
                hard_data: LayerScore::new(20.0, 70.0, vec![]),
                technical: LayerScore::new(20.0, 70.0, vec![]),
                behavioral: LayerScore::new(20.0, 70.0, vec![]),
                economic: LayerScore::new(20.0, 70.0, vec![]),
            },
            weights_version: 1,
            key_factors: KeyFactors::default(),
            status: PredictionStatus::Pending,
            outcome: None,
            learning_processed_at: None,
            pattern_processed_at: None,
        }
    }

    fn fast_config() -> ResolverConfig {
        ResolverConfig {
            retry_backoff: std::time::Duration::from_millis(1),
            ..ResolverConfig::default()
        }
    }

    fn stored(ledger: &Ledger, p: &MarketPrediction) -> MarketPrediction {
        let id = ledger.append_prediction(p, None).unwrap();
        ledger.get_prediction(id).unwrap().unwrap()
    }

    #[test]
    fn test_outcome_thresholding() {
        let p = pending(Direction::Up);
        let up = evaluate_outcome(&p, 102.0, 1.0, t0()).unwrap();
        assert_eq!(up.actual_direction, Direction::Up);
        assert!(up.prediction_correct);
        assert!((up.actual_return_pct - 2.0).abs() < 1e-9);

        let flat = evaluate_outcome(&p, 100.3, 1.0, t0()).unwrap();
        assert_eq!(flat.actual_direction, Direction::Neutral);
        assert!(!flat.prediction_correct);

        let neutral = pending(Direction::Neutral);
        assert!(evaluate_outcome(&neutral, 100.3, 1.0, t0()).unwrap().prediction_correct);

        let down = evaluate_outcome(&p, 97.0, 1.0, t0()).unwrap();
        assert!(!down.prediction_correct);

        let mut bad = pending(Direction::Up);
        bad.price_at_prediction = 0.0;
        assert!(evaluate_outcome(&bad, 101.0, 1.0, t0()).is_none());
    }

    #[tokio::test]
    async fn test_resolve_writes_outcome_once() {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let p = stored(&ledger, &pending(Direction::Up));

        let mut prices = MockPriceSource::new();
        prices
            .expect_price_at()
            .times(1)
            .returning(|_, _| Ok(Some(102.0)));
        let resolver = OutcomeResolver::new(ledger.clone(), Arc::new(prices), fast_config());

        let now = t0() + Duration::days(2);
        match resolver.resolve(&p, now).await.unwrap() {
            ResolveResult::Resolved { status, .. } => assert_eq!(status, PredictionStatus::Correct),
            other => panic!("unexpected {:?}", other),
        }

        // Stale copy still says pending; the conditional update refuses it
        let again = resolver.resolve_due(now).await.unwrap();
        assert_eq!(again.due, 0);
        let refreshed = ledger.get_prediction(p.id).unwrap().unwrap();
        assert_eq!(
            resolver.resolve(&refreshed, now).await.unwrap(),
            ResolveResult::AlreadyResolved
        );
    }

    #[tokio::test]
    async fn test_not_due_is_untouched() {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let p = stored(&ledger, &pending(Direction::Up));
        let mut prices = MockPriceSource::new();
        prices.expect_price_at().times(0);
        let resolver = OutcomeResolver::new(ledger, Arc::new(prices), fast_config());
        assert_eq!(resolver.resolve(&p, t0()).await.unwrap(), ResolveResult::StillPending);
    }

    #[tokio::test]
    async fn test_missing_price_pending_then_expired() {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let p = stored(&ledger, &pending(Direction::Up));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut prices = MockPriceSource::new();
        prices.expect_price_at().returning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::PriceUnavailable {
                symbol: "SPY".into(),
                at: t0(),
            })
        });
        let resolver = OutcomeResolver::new(ledger.clone(), Arc::new(prices), fast_config());

        // Inside the grace window
        let report = resolver.resolve_due(t0() + Duration::days(2)).await.unwrap();
        assert_eq!(report.still_pending, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Past target + grace
        let report = resolver.resolve_due(t0() + Duration::days(5)).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 6);

        let stored = ledger.get_prediction(p.id).unwrap().unwrap();
        assert_eq!(stored.status, PredictionStatus::Expired);
        assert!(stored.outcome.is_none());
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        stored(&ledger, &pending(Direction::Down));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut prices = MockPriceSource::new();
        prices.expect_price_at().returning(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(None)
            } else {
                Ok(Some(97.5))
            }
        });
        let resolver = OutcomeResolver::new(ledger, Arc::new(prices), fast_config());

        let report = resolver.resolve_due(t0() + Duration::days(1)).await.unwrap();
        assert_eq!(report.correct, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
