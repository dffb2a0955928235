//! Configuration section types

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Symbols fused on every run
    pub symbols: Vec<String>,
    /// Prediction horizons in days
    pub horizons_days: Vec<u32>,
    /// Data directory (ledger, price CSVs, exports, evidence files)
    pub data_dir: String,
    /// SQLite file name inside `data_dir`
    pub db_file: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WeightsConfig {
    pub hard_data: f64,
    pub technical: f64,
    pub behavioral: f64,
    pub economic: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FusionSection {
    /// Seed weights when the ledger holds no version yet
    pub weights: WeightsConfig,
    /// Confidence (0-100) above which a trade is suggested
    pub trade_confidence_threshold: f64,
    /// |composite| above which the action is STRONG_*
    pub strong_score_threshold: f64,
    /// Minimum weight any layer keeps
    pub weight_floor: f64,
    pub stop_loss_vol_multiple: f64,
    pub take_profit_vol_multiple: f64,
    /// Used for position sizing before any calibration exists
    pub default_accuracy_volatility: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScorersSection {
    /// Evidence older than this is treated as unavailable
    pub max_staleness_secs: u64,
    pub rsi_period: usize,
    /// Directory of `<SYMBOL>.json` evidence snapshots; defaults to `<data_dir>/evidence`
    pub evidence_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    /// Ad-hoc exchange closures, `YYYY-MM-DD`
    pub extra_holidays: Vec<String>,
    /// Resolved trades before a realized session win rate replaces the static prior
    pub min_prior_samples: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverSection {
    pub neutral_return_threshold_pct: f64,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub expiry_grace_days: i64,
    /// "csv" or "yahoo"
    pub price_lookup: String,
    pub yahoo_base_url: String,
    /// Oldest tick accepted as the price at an instant
    pub price_max_age_hours: i64,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalibrationSection {
    pub decay_factor: f64,
    pub gain: f64,
    pub max_adjustment: f64,
    pub layer_neutral_band: f64,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BacktestSection {
    pub min_sample: usize,
    pub divergence_margin: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatternsSection {
    pub min_occurrences_required: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub fuse_interval_secs: u64,
    pub resolve_interval_secs: u64,
    pub calibrate_interval_secs: u64,
    pub analytics_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// JSON log lines instead of the human format
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub bind: String,
}
