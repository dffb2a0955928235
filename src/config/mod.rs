//! Configuration management for SignalFuse
//!
//! Defaults, then optional `config/default.*` and `config/local.*` files,
//! then `SIGNALFUSE__SECTION__KEY` environment variables (`.env` honoured).

mod types;

pub use types::*;

use anyhow::{bail, Context, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

use crate::backtesting::BacktestConfig;
use crate::calibration::{CalibratorConfig, LearningParams};
use crate::fusion::{FusionConfig, LayerWeights};
use crate::ledger::ResolverConfig;
use crate::patterns::PatternConfig;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub fusion: FusionSection,
    pub scorers: ScorersSection,
    pub session: SessionSection,
    pub resolver: ResolverSection,
    pub calibration: CalibrationSection,
    pub backtest: BacktestSection,
    pub patterns: PatternsSection,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
    pub dashboard: DashboardConfig,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Self::with_defaults()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (SIGNALFUSE__*)
            .add_source(Environment::with_prefix("SIGNALFUSE").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        app_config.validate()?;

        Ok(app_config)
    }

    /// Built-in defaults only
    pub fn defaults() -> Result<Self> {
        Self::with_defaults()?
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    fn with_defaults() -> Result<ConfigBuilder<DefaultState>> {
        let builder = Config::builder()
            // Engine defaults
            .set_default("engine.symbols", vec!["SPY", "QQQ"])?
            .set_default("engine.horizons_days", vec![1, 5])?
            .set_default("engine.data_dir", "./data")?
            .set_default("engine.db_file", "signalfuse.sqlite")?
            // Fusion defaults
            .set_default("fusion.weights.hard_data", 0.35)?
            .set_default("fusion.weights.technical", 0.25)?
            .set_default("fusion.weights.behavioral", 0.20)?
            .set_default("fusion.weights.economic", 0.20)?
            .set_default("fusion.trade_confidence_threshold", 60.0)?
            .set_default("fusion.strong_score_threshold", 30.0)?
            .set_default("fusion.weight_floor", 0.05)?
            .set_default("fusion.stop_loss_vol_multiple", 1.5)?
            .set_default("fusion.take_profit_vol_multiple", 2.5)?
            .set_default("fusion.default_accuracy_volatility", 0.25)?
            // Scorer defaults
            .set_default("scorers.max_staleness_secs", 86_400)?
            .set_default("scorers.rsi_period", 14)?
            // Session defaults
            .set_default("session.extra_holidays", Vec::<String>::new())?
            .set_default("session.min_prior_samples", 30)?
            // Resolver defaults
            .set_default("resolver.neutral_return_threshold_pct", 1.0)?
            .set_default("resolver.max_attempts", 3)?
            .set_default("resolver.retry_backoff_ms", 500)?
            .set_default("resolver.expiry_grace_days", 3)?
            .set_default("resolver.price_lookup", "yahoo")?
            .set_default("resolver.yahoo_base_url", "https://query1.finance.yahoo.com")?
            .set_default("resolver.price_max_age_hours", 96)?
            .set_default("resolver.batch_size", 500)?
            // Calibration defaults
            .set_default("calibration.decay_factor", 0.95)?
            .set_default("calibration.gain", 0.2)?
            .set_default("calibration.max_adjustment", 0.10)?
            .set_default("calibration.layer_neutral_band", 10.0)?
            .set_default("calibration.batch_size", 500)?
            // Backtest / pattern defaults
            .set_default("backtest.min_sample", 20)?
            .set_default("backtest.divergence_margin", 0.10)?
            .set_default("patterns.min_occurrences_required", 10)?
            // Scheduler defaults
            .set_default("scheduler.fuse_interval_secs", 300)?
            .set_default("scheduler.resolve_interval_secs", 3600)?
            .set_default("scheduler.calibrate_interval_secs", 3600)?
            .set_default("scheduler.analytics_interval_secs", 21_600)?
            // Logging / dashboard defaults
            .set_default("logging.json", false)?
            .set_default("dashboard.enabled", false)?
            .set_default("dashboard.bind", "127.0.0.1:8090")?;
        Ok(builder)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.engine.symbols.is_empty() {
            bail!("engine.symbols must list at least one symbol");
        }
        if self.engine.horizons_days.is_empty() || self.engine.horizons_days.contains(&0) {
            bail!("engine.horizons_days must be non-empty and positive");
        }
        let w = self.fusion.weights;
        let weights = [w.hard_data, w.technical, w.behavioral, w.economic];
        let negative = weights.iter().any(|x| !x.is_finite() || *x < 0.0);
        if negative || weights.iter().sum::<f64>() <= 0.0 {
            bail!("fusion.weights must be non-negative with a positive sum");
        }
        if !(0.0..=0.25).contains(&self.fusion.weight_floor) {
            bail!("fusion.weight_floor must be within [0, 0.25]");
        }
        if !(self.calibration.decay_factor > 0.0 && self.calibration.decay_factor < 1.0) {
            bail!("calibration.decay_factor must be within (0, 1)");
        }
        let max_adjustment = self.calibration.max_adjustment;
        if !max_adjustment.is_finite() || !(0.0..=1.0).contains(&max_adjustment) {
            bail!("calibration.max_adjustment must be within [0, 1]");
        }
        if !self.calibration.gain.is_finite() || self.calibration.gain < 0.0 {
            bail!("calibration.gain must be finite and non-negative");
        }
        if self.resolver.expiry_grace_days < 0 {
            bail!("resolver.expiry_grace_days must be non-negative");
        }
        if !matches!(self.resolver.price_lookup.as_str(), "csv" | "yahoo") {
            bail!(
                "resolver.price_lookup must be 'csv' or 'yahoo', got '{}'",
                self.resolver.price_lookup
            );
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.engine.data_dir)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join(&self.engine.db_file)
    }

    pub fn evidence_dir(&self) -> PathBuf {
        self.scorers
            .evidence_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.data_dir().join("evidence"))
    }

    pub fn default_weights(&self) -> LayerWeights {
        let w = self.fusion.weights;
        LayerWeights::new(w.hard_data, w.technical, w.behavioral, w.economic).normalized()
    }

    pub fn fusion_config(&self) -> FusionConfig {
        FusionConfig {
            trade_confidence_threshold: self.fusion.trade_confidence_threshold,
            strong_score_threshold: self.fusion.strong_score_threshold,
            stop_loss_vol_multiple: self.fusion.stop_loss_vol_multiple,
            take_profit_vol_multiple: self.fusion.take_profit_vol_multiple,
            default_accuracy_volatility: self.fusion.default_accuracy_volatility,
            layer_neutral_band: self.calibration.layer_neutral_band,
        }
    }

    pub fn calibrator_config(&self) -> CalibratorConfig {
        CalibratorConfig {
            params: LearningParams {
                decay_factor: self.calibration.decay_factor,
                gain: self.calibration.gain,
                max_adjustment: self.calibration.max_adjustment,
            },
            weight_floor: self.fusion.weight_floor,
            layer_neutral_band: self.calibration.layer_neutral_band,
            batch_size: self.calibration.batch_size,
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            neutral_return_threshold_pct: self.resolver.neutral_return_threshold_pct,
            max_attempts: self.resolver.max_attempts,
            retry_backoff: std::time::Duration::from_millis(self.resolver.retry_backoff_ms),
            expiry_grace: chrono::Duration::days(self.resolver.expiry_grace_days),
            batch_size: self.resolver.batch_size,
        }
    }

    pub fn backtest_config(&self) -> BacktestConfig {
        BacktestConfig {
            min_sample: self.backtest.min_sample,
            divergence_margin: self.backtest.divergence_margin,
            layer_neutral_band: self.calibration.layer_neutral_band,
        }
    }

    pub fn pattern_config(&self) -> PatternConfig {
        PatternConfig {
            min_occurrences_required: self.patterns.min_occurrences_required,
            layer_neutral_band: self.calibration.layer_neutral_band,
            batch_size: self.calibration.batch_size,
        }
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "symbols={:?} horizons={:?} price_lookup={} trade_conf={:.0} floor={:.2} decay={:.2} data_dir={}",
            self.engine.symbols,
            self.engine.horizons_days,
            self.resolver.price_lookup,
            self.fusion.trade_confidence_threshold,
            self.fusion.weight_floor,
            self.calibration.decay_factor,
            self.engine.data_dir
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
