//! SignalFuse daemon
//!
//! Loads configuration, opens the ledger and runs the fuse / resolve /
//! calibrate / analytics stages until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use signalfuse::backtesting::{BacktestConfig, BacktestEngine};
use signalfuse::calibration::WeightCalibrator;
use signalfuse::config::AppConfig;
use signalfuse::fusion::{FusionService, SignalFuser};
use signalfuse::ledger::{CsvPriceSource, Ledger, OutcomeResolver, PriceSource, YahooPriceSource};
use signalfuse::patterns::PatternDetector;
use signalfuse::persistence::CsvPersistence;
use signalfuse::pipeline::{Pipeline, PipelineConfig};
use signalfuse::scorers::{JsonEvidenceFeed, ScorerSet};
use signalfuse::session::{MarketCalendar, NyseCalendar};

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("signalfuse=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(feature = "dashboard")]
fn spawn_dashboard(
    config: &AppConfig,
    ledger: Arc<Ledger>,
    backtest_config: BacktestConfig,
    calendar: Arc<dyn MarketCalendar>,
) -> Option<JoinHandle<()>> {
    use signalfuse::dashboard::{start_server, DashboardState};

    if !config.dashboard.enabled {
        return None;
    }
    let state = DashboardState::new(
        ledger.clone(),
        Arc::new(BacktestEngine::new(ledger, backtest_config)),
        calendar,
        config.session.min_prior_samples,
    );
    let bind = config.dashboard.bind.clone();
    Some(tokio::spawn(async move {
        if let Err(e) = start_server(state, &bind).await {
            error!(error = %e, "Dashboard server stopped");
        }
    }))
}

#[cfg(not(feature = "dashboard"))]
fn spawn_dashboard(
    config: &AppConfig,
    _ledger: Arc<Ledger>,
    _backtest_config: BacktestConfig,
    _calendar: Arc<dyn MarketCalendar>,
) -> Option<JoinHandle<()>> {
    if config.dashboard.enabled {
        tracing::warn!(
            "dashboard.enabled is set but the binary was built without the `dashboard` feature"
        );
    }
    None
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_tracing(config.logging.json);
    info!(config = %config, "Starting SignalFuse");

    std::fs::create_dir_all(config.data_dir())
        .with_context(|| format!("Failed to create data dir {}", config.data_dir().display()))?;

    let ledger = Arc::new(
        Ledger::open(config.db_path())
            .with_context(|| format!("Failed to open ledger at {}", config.db_path().display()))?,
    );
    let weights = ledger.ensure_default_weights(&config.default_weights(), Utc::now())?;
    info!(version = weights.version, weights = ?weights.weights, "Fusion weights loaded");

    let persistence = Arc::new(CsvPersistence::new(config.data_dir())?);
    let price_max_age = chrono::Duration::hours(config.resolver.price_max_age_hours);
    let calendar: Arc<dyn MarketCalendar> = Arc::new(
        NyseCalendar::from_config(&config.session.extra_holidays)
            .context("Invalid session.extra_holidays")?,
    );

    let csv_lookup = config.resolver.price_lookup == "csv";
    let prices: Arc<dyn PriceSource> = if csv_lookup {
        Arc::new(CsvPriceSource::new(persistence.clone(), price_max_age))
    } else {
        Arc::new(YahooPriceSource::new(&config.resolver.yahoo_base_url, price_max_age)?)
    };

    let scorers = ScorerSet::new(
        config.scorers.rsi_period,
        chrono::Duration::seconds(config.scorers.max_staleness_secs as i64),
    );
    let mut fusion = FusionService::new(
        ledger.clone(),
        Arc::new(JsonEvidenceFeed::new(config.evidence_dir())),
        prices.clone(),
        calendar.clone(),
        scorers,
        SignalFuser::new(config.fusion_config()),
        config.session.min_prior_samples,
    );
    // CSV lookups already read from the price files; only external quotes are logged
    if !csv_lookup {
        fusion = fusion.with_price_log(persistence.clone(), &config.resolver.price_lookup);
    }

    let backtest_config = config.backtest_config();
    let pipeline = Arc::new(Pipeline::new(
        ledger.clone(),
        Arc::new(fusion),
        OutcomeResolver::new(ledger.clone(), prices, config.resolver_config()),
        WeightCalibrator::new(ledger.clone(), config.calibrator_config()),
        BacktestEngine::new(ledger.clone(), backtest_config.clone()),
        PatternDetector::new(ledger.clone(), config.pattern_config()),
        Some(persistence),
        PipelineConfig {
            symbols: config.engine.symbols.clone(),
            horizons_days: config.engine.horizons_days.clone(),
            fuse_interval: Duration::from_secs(config.scheduler.fuse_interval_secs),
            resolve_interval: Duration::from_secs(config.scheduler.resolve_interval_secs),
            calibrate_interval: Duration::from_secs(config.scheduler.calibrate_interval_secs),
            analytics_interval: Duration::from_secs(config.scheduler.analytics_interval_secs),
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = pipeline.spawn(shutdown_rx);

    let dashboard = spawn_dashboard(&config, ledger.clone(), backtest_config, calendar);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Pipeline stage panicked");
        }
    }
    if let Some(server) = dashboard {
        server.abort();
    }

    info!("SignalFuse stopped");
    Ok(())
}
