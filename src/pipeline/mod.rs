//! Pipeline scheduling
//!
//! Fuse, resolve, calibrate and analytics run as separate periodic tasks.
//! They share nothing but the ledger; each one can be late, fail or be
//! re-run without the others noticing.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::backtesting::{AccuracyMetrics, BacktestEngine};
use crate::calibration::{CalibrationReport, WeightCalibrator};
use crate::error::EngineResult;
use crate::fusion::{CombinedSignal, FusionService};
use crate::ledger::{Ledger, OutcomeResolver, ResolveReport};
use crate::patterns::{PatternDetector, PatternReport};
use crate::persistence::CsvPersistence;

/// Window the analytics stage backtests on every run
const ANALYTICS_LOOKBACK_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub symbols: Vec<String>,
    pub horizons_days: Vec<u32>,
    pub fuse_interval: Duration,
    pub resolve_interval: Duration,
    pub calibrate_interval: Duration,
    pub analytics_interval: Duration,
}

/// Output of one analytics run
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsReport {
    pub patterns: PatternReport,
    pub sessions_refreshed: usize,
    pub accuracy: AccuracyMetrics,
    pub recommendations: Vec<String>,
    /// Rows in the audit export, when CSV persistence is attached
    pub exported: Option<usize>,
}

pub struct Pipeline {
    ledger: Arc<Ledger>,
    fusion: Arc<FusionService>,
    resolver: OutcomeResolver,
    calibrator: WeightCalibrator,
    backtest: BacktestEngine,
    patterns: PatternDetector,
    persistence: Option<Arc<CsvPersistence>>,
    config: PipelineConfig,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<Ledger>,
        fusion: Arc<FusionService>,
        resolver: OutcomeResolver,
        calibrator: WeightCalibrator,
        backtest: BacktestEngine,
        patterns: PatternDetector,
        persistence: Option<Arc<CsvPersistence>>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            ledger,
            fusion,
            resolver,
            calibrator,
            backtest,
            patterns,
            persistence,
            config,
        }
    }

    /// One fusion run per (symbol, horizon), fanned out concurrently
    pub async fn fuse_all(&self, now: DateTime<Utc>) -> EngineResult<Vec<CombinedSignal>> {
        let mut set = JoinSet::new();
        for symbol in &self.config.symbols {
            for &horizon in &self.config.horizons_days {
                let fusion = self.fusion.clone();
                let symbol = symbol.clone();
                set.spawn(async move { fusion.run_once(&symbol, horizon, now).await });
            }
        }

        let mut signals = Vec::new();
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(Some(signal))) => signals.push(signal),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Fusion run failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => error!(error = %e, "Fusion task panicked"),
            }
        }

        match first_error {
            Some(e) if signals.is_empty() => Err(e),
            _ => Ok(signals),
        }
    }

    pub async fn resolve(&self, now: DateTime<Utc>) -> EngineResult<ResolveReport> {
        self.resolver.resolve_due(now).await
    }

    pub fn calibrate(&self, now: DateTime<Utc>) -> EngineResult<CalibrationReport> {
        self.calibrator.recalibrate(now)
    }

    /// Patterns, session priors, accuracy and the audit export
    pub fn analytics(&self, now: DateTime<Utc>) -> EngineResult<AnalyticsReport> {
        let patterns = self.patterns.detect_patterns(now)?;
        let sessions = self.backtest.refresh_session_performance(now)?;
        let accuracy = self.backtest.accuracy_metrics(None, now)?;

        let summary = self.backtest.run_backtest(
            None,
            Some(now - ChronoDuration::days(ANALYTICS_LOOKBACK_DAYS)),
            Some(now),
        )?;
        for recommendation in &summary.recommendations {
            info!(recommendation = %recommendation, "Backtest recommendation");
        }

        let exported = match &self.persistence {
            Some(persistence) => {
                let rows = self.ledger.predictions_between(None, None, None)?;
                let path = persistence
                    .exports_dir()
                    .join(format!("predictions_{}.csv", now.format("%Y-%m-%d")));
                Some(persistence.export_predictions(&rows, path)?)
            }
            None => None,
        };

        info!(
            accuracy_7d = ?accuracy.accuracy_7d,
            accuracy_30d = ?accuracy.accuracy_30d,
            brier = ?accuracy.brier_score,
            pending = accuracy.pending,
            expired = accuracy.expired,
            active_patterns = patterns.patterns.iter().filter(|p| p.is_active).count(),
            "Analytics run complete"
        );

        Ok(AnalyticsReport {
            patterns,
            sessions_refreshed: sessions.len(),
            accuracy,
            recommendations: summary.recommendations,
            exported,
        })
    }

    /// `calibrate` on the blocking pool; the batch holds the ledger lock throughout
    pub async fn calibrate_blocking(
        self: Arc<Self>,
        now: DateTime<Utc>,
    ) -> EngineResult<CalibrationReport> {
        tokio::task::spawn_blocking(move || self.calibrate(now)).await?
    }

    /// `analytics` on the blocking pool
    pub async fn analytics_blocking(
        self: Arc<Self>,
        now: DateTime<Utc>,
    ) -> EngineResult<AnalyticsReport> {
        tokio::task::spawn_blocking(move || self.analytics(now)).await?
    }

    /// Spawn the four periodic stages; they stop when `shutdown` turns true
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let fuse = self.clone();
        let resolve = self.clone();
        let calibrate = self.clone();
        let analytics = self.clone();

        vec![
            spawn_stage("fuse", self.config.fuse_interval, shutdown.clone(), move || {
                let p = fuse.clone();
                async move {
                    match p.fuse_all(Utc::now()).await {
                        Ok(signals) => debug!(signals = signals.len(), "Fuse stage done"),
                        Err(e) => error!(error = %e, "Fuse stage failed"),
                    }
                }
            }),
            spawn_stage("resolve", self.config.resolve_interval, shutdown.clone(), move || {
                let p = resolve.clone();
                async move {
                    if let Err(e) = p.resolve(Utc::now()).await {
                        error!(error = %e, "Resolve stage failed");
                    }
                }
            }),
            spawn_stage("calibrate", self.config.calibrate_interval, shutdown.clone(), move || {
                let p = calibrate.clone();
                async move {
                    if let Err(e) = p.calibrate_blocking(Utc::now()).await {
                        error!(error = %e, "Calibrate stage failed");
                    }
                }
            }),
            spawn_stage("analytics", self.config.analytics_interval, shutdown, move || {
                let p = analytics.clone();
                async move {
                    if let Err(e) = p.analytics_blocking(Utc::now()).await {
                        error!(error = %e, "Analytics stage failed");
                    }
                }
            }),
        ]
    }
}

fn spawn_stage<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut stage: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        if period.is_zero() {
            warn!(stage = name, "Zero interval, stage disabled");
            return;
        }
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(stage = name, interval_secs = period.as_secs(), "Stage started");

        loop {
            tokio::select! {
                _ = ticker.tick() => stage().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(stage = name, "Stage stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtesting::BacktestConfig;
    use crate::calibration::CalibratorConfig;
    use crate::fusion::{LayerWeights, SignalFuser};
    use crate::ledger::{InMemoryPriceSource, ResolverConfig};
    use crate::patterns::PatternConfig;
    use crate::scorers::{
        EvidenceSnapshot, HardDataInputs, InMemoryEvidenceFeed, ScorerSet, Stamped,
    };
    use crate::session::NyseCalendar;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 10, 14, 0, 0).unwrap()
    }

    async fn pipeline(persistence: Option<Arc<CsvPersistence>>, interval: Duration) -> Pipeline {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        ledger
            .ensure_default_weights(&LayerWeights::default(), now())
            .unwrap();

        let feed = Arc::new(InMemoryEvidenceFeed::new());
        let prices = Arc::new(InMemoryPriceSource::new());
        for symbol in ["SPY", "QQQ"] {
            let snapshot = EvidenceSnapshot {
                hard_data: Some(Stamped::new(
                    now(),
                    HardDataInputs {
                        order_flow_imbalance: 0.4,
                        dark_pool_buy_ratio: None,
                        put_call_ratio: Some(0.8),
                        institutional_net_flow: None,
                    },
                )),
                ..Default::default()
            };
            feed.insert(symbol, snapshot).await;
        }
        // IWM has neither evidence nor a price
        prices.insert("SPY", now(), 550.0).await;
        prices.insert("QQQ", now(), 480.0).await;

        let fusion = FusionService::new(
            ledger.clone(),
            feed,
            prices.clone(),
            Arc::new(NyseCalendar::new()),
            ScorerSet::default(),
            SignalFuser::default(),
            30,
        );
        Pipeline::new(
            ledger.clone(),
            Arc::new(fusion),
            OutcomeResolver::new(ledger.clone(), prices, ResolverConfig::default()),
            WeightCalibrator::new(ledger.clone(), CalibratorConfig::default()),
            BacktestEngine::new(ledger.clone(), BacktestConfig::default()),
            PatternDetector::new(ledger.clone(), PatternConfig::default()),
            persistence,
            PipelineConfig {
                symbols: vec!["SPY".into(), "QQQ".into(), "IWM".into()],
                horizons_days: vec![1, 5],
                fuse_interval: interval,
                resolve_interval: interval,
                calibrate_interval: interval,
                analytics_interval: interval,
            },
        )
    }

    #[tokio::test]
    async fn test_fuse_all_skips_symbols_without_price() {
        let p = pipeline(None, Duration::from_secs(3600)).await;
        let signals = p.fuse_all(now()).await.unwrap();
        assert_eq!(signals.len(), 4);
        assert!(signals.iter().all(|s| s.symbol != "IWM"));
        // Only the hard data layer had evidence
        assert!(signals.iter().all(|s| s.layers.available_count() == 1));

        let stored = p.ledger.predictions_between(None, None, None).unwrap();
        assert_eq!(stored.len(), 4);
        assert!(p.resolve(now()).await.unwrap().due == 0);
    }

    #[tokio::test]
    async fn test_analytics_exports_ledger() {
        let dir = std::env::temp_dir()
            .join(format!("signalfuse_pipeline_{}", uuid::Uuid::new_v4()));
        let persistence = Arc::new(CsvPersistence::new(&dir).unwrap());
        let p = pipeline(Some(persistence.clone()), Duration::from_secs(3600)).await;
        p.fuse_all(now()).await.unwrap();

        let report = p.analytics(now() + ChronoDuration::hours(1)).unwrap();
        assert_eq!(report.exported, Some(4));
        assert_eq!(report.accuracy.pending, 4);
        assert_eq!(report.accuracy.accuracy_7d, None);
        assert!(persistence.exports_dir().join("predictions_2024-07-10.csv").exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_batch_stages_run_on_blocking_pool() {
        let dir = std::env::temp_dir()
            .join(format!("signalfuse_blocking_{}", uuid::Uuid::new_v4()));
        let persistence = Arc::new(CsvPersistence::new(&dir).unwrap());
        let p = Arc::new(pipeline(Some(persistence), Duration::from_secs(3600)).await);
        p.fuse_all(now()).await.unwrap();

        let calibration = p.clone().calibrate_blocking(now()).await.unwrap();
        assert_eq!(calibration.processed, 0);
        assert_eq!(calibration.weights.version, 1);

        let later = now() + ChronoDuration::hours(1);
        let analytics = p.clone().analytics_blocking(later).await.unwrap();
        assert_eq!(analytics.exported, Some(4));
        assert_eq!(analytics.accuracy.pending, 4);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_stages_stop_on_shutdown() {
        let p = Arc::new(pipeline(None, Duration::from_secs(3600)).await);
        let (tx, rx) = watch::channel(false);
        let handles = p.clone().spawn(rx);
        assert_eq!(handles.len(), 4);

        tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .expect("stage did not stop")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_zero_interval_disables_stage() {
        let p = Arc::new(pipeline(None, Duration::ZERO).await);
        let (_tx, rx) = watch::channel(false);
        for handle in p.spawn(rx) {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("disabled stage kept running")
                .unwrap();
        }
    }
}
