//! Dashboard Module
//!
//! Read-only HTTP API over the ledger and its aggregates.
//! Only compiled when the `dashboard` feature is enabled.

mod api;
mod types;

pub use api::create_router;
pub use types::*;

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::backtesting::{AccuracyMetrics, BacktestEngine, BacktestSummary};
use crate::error::EngineResult;
use crate::fusion::CombinedSignal;
use crate::ledger::Ledger;
use crate::patterns::PredictionPattern;
use crate::session::{MarketCalendar, SessionAnalysis, SessionClassifier};

/// Weight versions returned by /api/weights
const WEIGHT_HISTORY_LIMIT: usize = 20;

/// Shared state behind every handler. Holds no caches; each read goes to the ledger.
#[derive(Clone)]
pub struct DashboardState {
    ledger: Arc<Ledger>,
    backtest: Arc<BacktestEngine>,
    calendar: Arc<dyn MarketCalendar>,
    min_prior_samples: u64,
}

impl DashboardState {
    pub fn new(
        ledger: Arc<Ledger>,
        backtest: Arc<BacktestEngine>,
        calendar: Arc<dyn MarketCalendar>,
        min_prior_samples: u64,
    ) -> Self {
        Self {
            ledger,
            backtest,
            calendar,
            min_prior_samples,
        }
    }

    /// Signal of the latest fusion run for a symbol
    pub fn latest_signal(&self, symbol: &str) -> EngineResult<Option<CombinedSignal>> {
        match self.ledger.latest_signal_json(symbol)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Session analysis with the realized priors currently in the ledger
    pub fn session_analysis(&self, now: DateTime<Utc>) -> EngineResult<SessionAnalysis> {
        let priors = self.ledger.session_priors()?;
        let classifier = SessionClassifier::new(self.min_prior_samples).with_priors(priors);
        Ok(classifier.analyze(now, Some(self.calendar.as_ref())))
    }

    pub fn backtest(
        &self,
        symbol: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> EngineResult<BacktestSummary> {
        self.backtest.run_backtest(symbol, from, to)
    }

    pub fn accuracy(
        &self,
        symbol: Option<&str>,
        now: DateTime<Utc>,
    ) -> EngineResult<AccuracyMetrics> {
        self.backtest.accuracy_metrics(symbol, now)
    }

    pub fn patterns(&self, active_only: bool) -> EngineResult<Vec<PredictionPattern>> {
        self.ledger.patterns(active_only)
    }

    pub fn weights(&self) -> EngineResult<WeightsResponse> {
        Ok(WeightsResponse {
            current: self.ledger.latest_weights()?,
            history: self.ledger.weight_history(WEIGHT_HISTORY_LIMIT)?,
        })
    }

    pub fn health(&self, now: DateTime<Utc>) -> EngineResult<HealthResponse> {
        Ok(HealthResponse {
            status: "ok".to_string(),
            timestamp: now,
            weights_version: self.ledger.latest_weights()?.version,
            pending_predictions: self.ledger.count_pending()?,
        })
    }
}

/// Start the dashboard server
pub async fn start_server(state: DashboardState, bind: &str) -> anyhow::Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;

    tracing::info!(addr = %listener.local_addr()?, "Dashboard API listening");

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtesting::BacktestConfig;
    use crate::session::{NyseCalendar, SessionState};
    use chrono::TimeZone;

    fn state() -> DashboardState {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let backtest = Arc::new(BacktestEngine::new(ledger.clone(), BacktestConfig::default()));
        DashboardState::new(ledger, backtest, Arc::new(NyseCalendar::new()), 30)
    }

    #[test]
    fn missing_signal_is_none() {
        assert!(state().latest_signal("SPY").unwrap().is_none());
    }

    #[test]
    fn session_analysis_uses_calendar() {
        // Wednesday 2024-07-10 10:00 New York (EDT, UTC-4)
        let ts = Utc.with_ymd_and_hms(2024, 7, 10, 14, 0, 0).unwrap();
        let analysis = state().session_analysis(ts).unwrap();
        assert_eq!(analysis.session, SessionState::NyAmPowerHour);
        assert!(analysis.profile.is_optimal_trading);
        assert!(analysis.calendar_error.is_none());
    }

    #[test]
    fn health_reports_fallback_weights_before_seeding() {
        let health = state().health(Utc::now()).unwrap();
        assert_eq!(health.weights_version, 0);
        assert_eq!(health.pending_predictions, 0);
    }

    #[tokio::test]
    async fn router_wraps_reads_in_api_response() {
        use axum::body::{to_bytes, Body};
        use axum::http::{Request, StatusCode};
        use tower::ServiceExt;

        let app = create_router(state());

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["status"], "ok");

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/api/signal/spy").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "no signal for SPY");

        let resp = app
            .oneshot(Request::builder().uri("/api/backtest").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["data"]["win_rate"], PLACEHOLDER);
        assert_eq!(json["data"]["insufficient_sample"], true);
    }
}
