//! Backtesting Module
//!
//! Read-side replay of resolved predictions:
//! - Win rate per trading session against the session prior
//! - Optimal vs non-optimal session comparison
//! - Breakdown by signal action and horizon
//! - Free-text recommendations when a prior looks wrong
//!
//! Nothing here mutates the prediction ledger; the only write is the
//! per-session aggregate used as the classifier's realized prior.

pub mod metrics;

pub use metrics::{AccuracyMetrics, CalibrationMetrics, LayerQuality};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::error::EngineResult;
use crate::ledger::Ledger;
use crate::session::SessionState;
use crate::types::{MarketPrediction, PredictionStatus, SignalAction};

/// Backtest configuration
#[derive(Debug, Clone)]
pub struct BacktestConfig {
    /// Resolved predictions needed before a win rate is reported
    pub min_sample: usize,
    /// |win rate - prior| that triggers a recommendation
    pub divergence_margin: f64,
    /// Dead band for a layer's own call in layer quality metrics
    pub layer_neutral_band: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            min_sample: 20,
            divergence_margin: 0.10,
            layer_neutral_band: 10.0,
        }
    }
}

/// Realized performance of one session window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPerformance {
    pub session: SessionState,
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: Option<f64>,
    pub prior_win_rate: f64,
    /// `win_rate - prior_win_rate`, only with a sufficient sample
    pub performance_vs_expected: Option<f64>,
    pub is_optimal_trading: bool,
    pub avg_confidence: Option<f64>,
    pub avg_return: Option<f64>,
}

/// Win rate of one category (action, horizon)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryPerformance {
    pub category: String,
    pub total_trades: usize,
    pub wins: usize,
    pub win_rate: Option<f64>,
    pub avg_return: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverallStats {
    /// Every prediction in range, whatever its status
    pub total_predictions: usize,
    /// `correct | incorrect` only
    pub resolved_trades: usize,
    pub wins: usize,
    pub pending: usize,
    pub expired: usize,
    /// Withheld below the minimum sample
    pub win_rate: Option<f64>,
    pub avg_confidence: Option<f64>,
    pub optimal_session_trades: usize,
    pub optimal_session_win_rate: Option<f64>,
    pub non_optimal_session_trades: usize,
    pub non_optimal_session_win_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestSummary {
    pub symbol: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub overall: OverallStats,
    pub sessions: Vec<SessionPerformance>,
    pub by_action: Vec<CategoryPerformance>,
    pub by_horizon: Vec<CategoryPerformance>,
    pub recommendations: Vec<String>,
    pub insufficient_sample: bool,
}

/// Running tally of resolved predictions
#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    trades: usize,
    wins: usize,
    confidence_sum: f64,
    return_sum: f64,
}

impl Tally {
    fn add(&mut self, p: &MarketPrediction) {
        self.trades += 1;
        if p.status == PredictionStatus::Correct {
            self.wins += 1;
        }
        self.confidence_sum += p.confidence;
        self.return_sum += p.directional_return().unwrap_or(0.0);
    }

    fn merge(&mut self, other: &Tally) {
        self.trades += other.trades;
        self.wins += other.wins;
        self.confidence_sum += other.confidence_sum;
        self.return_sum += other.return_sum;
    }

    fn mean(&self, sum: f64) -> Option<f64> {
        (self.trades > 0).then(|| sum / self.trades as f64)
    }

    fn win_rate(&self) -> Option<f64> {
        self.mean(self.wins as f64)
    }
}

fn pct(rate: f64) -> f64 {
    rate * 100.0
}

/// Backtester over the prediction ledger
pub struct BacktestEngine {
    ledger: Arc<Ledger>,
    config: BacktestConfig,
}

impl BacktestEngine {
    pub fn new(ledger: Arc<Ledger>, config: BacktestConfig) -> Self {
        Self { ledger, config }
    }

    /// Replay predictions made in the half-open window `[from, to)` (open ends allowed)
    pub fn run_backtest(
        &self,
        symbol: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> EngineResult<BacktestSummary> {
        let predictions = self.ledger.predictions_between(symbol, from, to)?;
        let mut summary = self.summarize(&predictions);
        summary.symbol = symbol.map(str::to_string);
        summary.from = from;
        summary.to = to;

        if summary.insufficient_sample {
            info!(
                symbol = symbol.unwrap_or("*"),
                resolved = summary.overall.resolved_trades,
                min_sample = self.config.min_sample,
                "Backtest sample too small for win rates"
            );
        }
        Ok(summary)
    }

    /// Pure aggregation over already loaded rows
    pub fn summarize(&self, predictions: &[MarketPrediction]) -> BacktestSummary {
        let min_sample = self.config.min_sample;
        let mut overall = OverallStats {
            total_predictions: predictions.len(),
            ..Default::default()
        };

        let mut by_session: BTreeMap<SessionState, Tally> = BTreeMap::new();
        let mut by_action: BTreeMap<&'static str, Tally> = BTreeMap::new();
        let mut by_horizon: BTreeMap<u32, Tally> = BTreeMap::new();
        let mut all = Tally::default();

        for p in predictions {
            match p.status {
                PredictionStatus::Pending => overall.pending += 1,
                PredictionStatus::Expired => overall.expired += 1,
                PredictionStatus::Correct | PredictionStatus::Incorrect => {
                    all.add(p);
                    by_session.entry(p.session).or_default().add(p);
                    by_action.entry(p.action.as_str()).or_default().add(p);
                    by_horizon.entry(p.horizon_days).or_default().add(p);
                }
            }
        }

        overall.resolved_trades = all.trades;
        overall.wins = all.wins;
        overall.avg_confidence = all.mean(all.confidence_sum);
        let insufficient_sample = all.trades < min_sample;
        overall.win_rate = if insufficient_sample { None } else { all.win_rate() };

        let mut optimal = Tally::default();
        let mut non_optimal = Tally::default();
        let mut recommendations = Vec::new();

        let sessions: Vec<SessionPerformance> = SessionState::ALL
            .into_iter()
            .filter_map(|state| by_session.get(&state).map(|t| (state, *t)))
            .map(|(state, tally)| {
                let prior = state.static_prior();
                if prior.is_optimal_trading {
                    optimal.merge(&tally);
                } else {
                    non_optimal.merge(&tally);
                }

                let win_rate = tally.win_rate();
                let performance_vs_expected = win_rate
                    .filter(|_| tally.trades >= min_sample)
                    .map(|wr| wr - prior.win_rate);

                if let Some(delta) = performance_vs_expected {
                    if delta.abs() > self.config.divergence_margin {
                        recommendations.push(format!(
                            "{}: realized win rate {:.1}% vs prior {:.1}% over {} trades; review the session prior",
                            state,
                            pct(prior.win_rate + delta),
                            pct(prior.win_rate),
                            tally.trades
                        ));
                    }
                }

                SessionPerformance {
                    session: state,
                    total_trades: tally.trades,
                    wins: tally.wins,
                    losses: tally.trades - tally.wins,
                    win_rate,
                    prior_win_rate: prior.win_rate,
                    performance_vs_expected,
                    is_optimal_trading: prior.is_optimal_trading,
                    avg_confidence: tally.mean(tally.confidence_sum),
                    avg_return: tally.mean(tally.return_sum),
                }
            })
            .collect();

        overall.optimal_session_trades = optimal.trades;
        overall.optimal_session_win_rate = optimal.win_rate();
        overall.non_optimal_session_trades = non_optimal.trades;
        overall.non_optimal_session_win_rate = non_optimal.win_rate();

        if insufficient_sample {
            recommendations.insert(
                0,
                format!(
                    "Insufficient sample: {} resolved predictions in range, {} needed before win rates are meaningful",
                    all.trades, min_sample
                ),
            );
        } else if let (Some(opt), Some(non)) = (
            overall.optimal_session_win_rate,
            overall.non_optimal_session_win_rate,
        ) {
            if optimal.trades >= min_sample && non_optimal.trades >= min_sample && opt <= non {
                recommendations.push(format!(
                    "Optimal sessions are not outperforming ({:.1}% vs {:.1}%); revisit the session multipliers",
                    pct(opt),
                    pct(non)
                ));
            }
        }

        let category = |name: String, t: &Tally| CategoryPerformance {
            category: name,
            total_trades: t.trades,
            wins: t.wins,
            win_rate: t.win_rate(),
            avg_return: t.mean(t.return_sum),
        };

        let by_action = SignalAction::ALL
            .into_iter()
            .filter_map(|a| by_action.get(a.as_str()).map(|t| category(a.to_string(), t)))
            .collect();
        let by_horizon = by_horizon
            .iter()
            .map(|(h, t)| category(format!("{}d", h), t))
            .collect();

        BacktestSummary {
            symbol: None,
            from: None,
            to: None,
            overall,
            sessions,
            by_action,
            by_horizon,
            recommendations,
            insufficient_sample,
        }
    }

    /// Accuracy headline for one symbol or all
    pub fn accuracy_metrics(
        &self,
        symbol: Option<&str>,
        now: DateTime<Utc>,
    ) -> EngineResult<AccuracyMetrics> {
        let predictions = self.ledger.predictions_between(symbol, None, Some(now))?;
        Ok(AccuracyMetrics::compute(
            &predictions,
            now,
            self.config.layer_neutral_band,
        ))
    }

    /// Recompute per-session win rates over the whole ledger and persist
    /// them as realized session priors
    pub fn refresh_session_performance(
        &self,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<(SessionState, u64, u64)>> {
        let predictions = self.ledger.predictions_between(None, None, None)?;
        let mut stats: BTreeMap<SessionState, (u64, u64)> = BTreeMap::new();
        for p in predictions.iter().filter(|p| p.status.is_scored()) {
            let entry = stats.entry(p.session).or_default();
            entry.0 += 1;
            if p.status == PredictionStatus::Correct {
                entry.1 += 1;
            }
        }

        let rows: Vec<(SessionState, u64, u64)> = stats
            .into_iter()
            .map(|(session, (total, wins))| (session, total, wins))
            .collect();
        self.ledger.save_session_stats(&rows, now)?;
        info!(sessions = rows.len(), "Session performance refreshed");
        Ok(rows)
    }
}
