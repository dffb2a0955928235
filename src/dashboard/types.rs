//! Dashboard API types
//!
//! Read models for the JSON endpoints. Raw numbers are kept next to
//! display strings; a missing metric renders as [`PLACEHOLDER`] so it is
//! never confused with a genuine zero or neutral reading.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backtesting::{AccuracyMetrics, BacktestSummary, CategoryPerformance, SessionPerformance};
use crate::fusion::{CombinedSignal, WeightRecord};
use crate::patterns::PredictionPattern;
use crate::session::SessionAnalysis;
use crate::types::{KeyFactors, Layer, LayerScore};

/// Shown in place of any unavailable metric
pub const PLACEHOLDER: &str = "—";

/// `0.684` -> `"68.4%"`, `None` -> placeholder
pub fn fmt_rate(rate: Option<f64>) -> String {
    match rate {
        Some(r) if r.is_finite() => format!("{:.1}%", r * 100.0),
        _ => PLACEHOLDER.to_string(),
    }
}

/// Value already in percent units
pub fn fmt_percent(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{:.1}%", v),
        _ => PLACEHOLDER.to_string(),
    }
}

pub fn fmt_number(value: Option<f64>, decimals: usize) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{:.*}", decimals, v),
        _ => PLACEHOLDER.to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerResponse {
    pub layer: Layer,
    pub available: bool,
    pub score: String,
    pub confidence: String,
    pub weight: String,
    pub signals: Vec<String>,
}

impl LayerResponse {
    pub fn new(layer: Layer, score: &LayerScore) -> Self {
        // An unavailable layer has no reading, only a reason
        let reading = |v: f64| score.available.then_some(v);
        Self {
            layer,
            available: score.available,
            score: fmt_number(reading(score.score), 1),
            confidence: fmt_percent(reading(score.confidence)),
            weight: fmt_rate(reading(score.weight)),
            signals: score.signals.clone(),
        }
    }
}

/// GET /api/signal/:symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalResponse {
    pub symbol: String,
    pub generated_at: DateTime<Utc>,
    pub horizon_days: u32,
    pub action: String,
    pub direction: String,
    pub composite_score: String,
    pub confidence: String,
    pub direction_probability: String,
    pub expected_accuracy: String,
    pub dominant_layer: String,
    pub regime: String,
    pub session: String,
    pub should_trade: bool,
    pub stop_loss: String,
    pub take_profit: String,
    pub weights_version: i64,
    pub layers: Vec<LayerResponse>,
    pub key_factors: KeyFactors,
    /// Unformatted signal for programmatic consumers
    pub raw: CombinedSignal,
}

impl From<CombinedSignal> for SignalResponse {
    fn from(signal: CombinedSignal) -> Self {
        let trade = &signal.trade;
        let (stop_loss, take_profit) = if trade.should_trade {
            (
                fmt_percent(Some(trade.stop_loss_percent)),
                fmt_percent(Some(trade.take_profit_percent)),
            )
        } else {
            (PLACEHOLDER.to_string(), PLACEHOLDER.to_string())
        };
        Self {
            symbol: signal.symbol.clone(),
            generated_at: signal.generated_at,
            horizon_days: signal.horizon_days,
            action: signal.action.to_string(),
            direction: signal.direction.to_string(),
            composite_score: fmt_number(Some(signal.composite_score), 1),
            confidence: fmt_percent(Some(signal.confidence)),
            direction_probability: fmt_rate(Some(signal.direction_probability)),
            expected_accuracy: fmt_rate(signal.expected_accuracy),
            dominant_layer: signal
                .dominant_layer
                .map(|l| l.to_string())
                .unwrap_or_else(|| PLACEHOLDER.to_string()),
            regime: signal.regime.to_string(),
            session: signal.session.to_string(),
            should_trade: trade.should_trade,
            stop_loss,
            take_profit,
            weights_version: signal.weights_version,
            layers: signal
                .layers
                .iter()
                .map(|(layer, score)| LayerResponse::new(layer, score))
                .collect(),
            key_factors: signal.key_factors.clone(),
            raw: signal,
        }
    }
}

/// GET /api/session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub timestamp: DateTime<Utc>,
    pub local_time: Option<NaiveDateTime>,
    pub session: String,
    pub is_optimal_trading: bool,
    pub signal_multiplier: String,
    pub win_rate: String,
    /// "static" until enough resolved trades back a realized rate
    pub win_rate_source: String,
    pub avg_volatility: String,
    pub avg_volume: String,
    pub next_session: String,
    pub minutes_to_next: String,
    pub calendar_error: Option<String>,
}

impl From<SessionAnalysis> for SessionResponse {
    fn from(analysis: SessionAnalysis) -> Self {
        let profile = &analysis.profile;
        let win_rate_source = if profile.prior_samples > 0 {
            format!("realized ({} trades)", profile.prior_samples)
        } else {
            "static".to_string()
        };
        Self {
            timestamp: analysis.timestamp,
            local_time: analysis.local_time,
            session: analysis.session.to_string(),
            is_optimal_trading: profile.is_optimal_trading,
            signal_multiplier: format!("{:.2}x", profile.signal_multiplier),
            win_rate: fmt_rate(Some(profile.win_rate)),
            win_rate_source,
            avg_volatility: fmt_percent(Some(profile.avg_volatility)),
            avg_volume: fmt_number(Some(profile.avg_volume), 2),
            next_session: analysis
                .next_session
                .map(|s| s.to_string())
                .unwrap_or_else(|| PLACEHOLDER.to_string()),
            minutes_to_next: analysis
                .minutes_to_next
                .map(|m| m.to_string())
                .unwrap_or_else(|| PLACEHOLDER.to_string()),
            calendar_error: analysis.calendar_error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRowResponse {
    pub session: String,
    pub total_trades: usize,
    pub win_rate: String,
    pub prior_win_rate: String,
    pub performance_vs_expected: String,
    pub is_optimal_trading: bool,
    pub avg_confidence: String,
    pub avg_return: String,
}

impl From<&SessionPerformance> for SessionRowResponse {
    fn from(s: &SessionPerformance) -> Self {
        Self {
            session: s.session.to_string(),
            total_trades: s.total_trades,
            win_rate: fmt_rate(s.win_rate),
            prior_win_rate: fmt_rate(Some(s.prior_win_rate)),
            performance_vs_expected: s
                .performance_vs_expected
                .map(|d| format!("{:+.1} pts", d * 100.0))
                .unwrap_or_else(|| PLACEHOLDER.to_string()),
            is_optimal_trading: s.is_optimal_trading,
            avg_confidence: fmt_percent(s.avg_confidence),
            avg_return: fmt_percent(s.avg_return),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRowResponse {
    pub category: String,
    pub total_trades: usize,
    pub win_rate: String,
    pub avg_return: String,
}

impl From<&CategoryPerformance> for CategoryRowResponse {
    fn from(c: &CategoryPerformance) -> Self {
        Self {
            category: c.category.clone(),
            total_trades: c.total_trades,
            win_rate: fmt_rate(c.win_rate),
            avg_return: fmt_percent(c.avg_return),
        }
    }
}

/// GET /api/backtest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResponse {
    pub symbol: String,
    pub total_predictions: usize,
    pub resolved_trades: usize,
    pub pending: usize,
    pub expired: usize,
    pub win_rate: String,
    pub optimal_session_win_rate: String,
    pub non_optimal_session_win_rate: String,
    pub sessions: Vec<SessionRowResponse>,
    pub by_action: Vec<CategoryRowResponse>,
    pub by_horizon: Vec<CategoryRowResponse>,
    pub recommendations: Vec<String>,
    pub insufficient_sample: bool,
    pub raw: BacktestSummary,
}

impl From<BacktestSummary> for BacktestResponse {
    fn from(summary: BacktestSummary) -> Self {
        let overall = &summary.overall;
        Self {
            symbol: summary
                .symbol
                .clone()
                .unwrap_or_else(|| "ALL".to_string()),
            total_predictions: overall.total_predictions,
            resolved_trades: overall.resolved_trades,
            pending: overall.pending,
            expired: overall.expired,
            win_rate: fmt_rate(overall.win_rate),
            optimal_session_win_rate: fmt_rate(overall.optimal_session_win_rate),
            non_optimal_session_win_rate: fmt_rate(overall.non_optimal_session_win_rate),
            sessions: summary.sessions.iter().map(SessionRowResponse::from).collect(),
            by_action: summary.by_action.iter().map(CategoryRowResponse::from).collect(),
            by_horizon: summary.by_horizon.iter().map(CategoryRowResponse::from).collect(),
            recommendations: summary.recommendations.clone(),
            insufficient_sample: summary.insufficient_sample,
            raw: summary,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerQualityResponse {
    pub layer: Layer,
    pub sample_count: usize,
    pub accuracy: String,
    pub brier_score: String,
}

/// GET /api/accuracy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccuracyResponse {
    pub accuracy_7d: String,
    pub accuracy_30d: String,
    pub accuracy_all: String,
    pub total: usize,
    pub pending: usize,
    pub correct: usize,
    pub incorrect: usize,
    pub expired: usize,
    pub brier_score: String,
    pub ece: String,
    pub layers: Vec<LayerQualityResponse>,
}

impl From<AccuracyMetrics> for AccuracyResponse {
    fn from(m: AccuracyMetrics) -> Self {
        Self {
            accuracy_7d: fmt_rate(m.accuracy_7d),
            accuracy_30d: fmt_rate(m.accuracy_30d),
            accuracy_all: fmt_rate(m.accuracy_all),
            total: m.total,
            pending: m.pending,
            correct: m.correct,
            incorrect: m.incorrect,
            expired: m.expired,
            brier_score: fmt_number(m.brier_score, 4),
            ece: fmt_number(m.ece, 4),
            layers: m
                .layers
                .iter()
                .map(|q| LayerQualityResponse {
                    layer: q.layer,
                    sample_count: q.sample_count,
                    accuracy: fmt_rate(q.accuracy),
                    brier_score: fmt_number(q.brier_score, 4),
                })
                .collect(),
        }
    }
}

/// GET /api/patterns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternResponse {
    pub signature: String,
    pub name: String,
    pub occurrences: u64,
    pub min_occurrences_required: u64,
    pub is_active: bool,
    /// Withheld until the pattern is active
    pub success_rate: String,
    pub avg_return: String,
    pub last_seen: DateTime<Utc>,
}

impl From<PredictionPattern> for PatternResponse {
    fn from(p: PredictionPattern) -> Self {
        let active = p.is_active;
        Self {
            signature: p.signature,
            name: p.name,
            occurrences: p.occurrences,
            min_occurrences_required: p.min_occurrences_required,
            is_active: active,
            success_rate: fmt_rate(active.then_some(p.success_rate)),
            avg_return: fmt_percent(active.then_some(p.avg_return)),
            last_seen: p.last_seen,
        }
    }
}

/// GET /api/weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightsResponse {
    pub current: WeightRecord,
    pub history: Vec<WeightRecord>,
}

/// GET /api/health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub weights_version: i64,
    pub pending_predictions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::PatternConditions;

    #[test]
    fn missing_metrics_render_as_placeholder() {
        assert_eq!(fmt_rate(None), PLACEHOLDER);
        assert_eq!(fmt_rate(Some(f64::NAN)), PLACEHOLDER);
        assert_eq!(fmt_rate(Some(0.684)), "68.4%");
        assert_eq!(fmt_percent(Some(0.0)), "0.0%");
        assert_eq!(fmt_number(None, 2), PLACEHOLDER);
    }

    #[test]
    fn unavailable_layer_is_not_shown_as_zero() {
        let layer = LayerResponse::new(Layer::Economic, &LayerScore::unavailable("feed down"));
        assert!(!layer.available);
        assert_eq!(layer.score, PLACEHOLDER);
        assert_eq!(layer.confidence, PLACEHOLDER);

        let neutral = LayerResponse::new(Layer::Technical, &LayerScore::new(0.0, 40.0, vec![]));
        assert_eq!(neutral.score, "0.0");
    }

    #[test]
    fn inactive_pattern_withholds_rates() {
        let cond = PatternConditions {
            min_layer_agreement: 3,
            min_confidence: 70.0,
            regime: None,
            horizon_days: None,
            session: None,
        };
        let mut pattern = PredictionPattern::new(cond, 10, Utc::now());
        pattern.record(true, 1.2, Utc::now());
        let resp = PatternResponse::from(pattern);
        assert!(!resp.is_active);
        assert_eq!(resp.success_rate, PLACEHOLDER);
    }
}
