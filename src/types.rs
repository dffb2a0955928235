//! Core types used throughout SignalFuse
//!
//! Defines evidence layers, regimes, directions, layer scores and the
//! `MarketPrediction` fact row shared by every pipeline stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::session::SessionState;

/// Independent evidence layers feeding the fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    HardData,
    Technical,
    Behavioral,
    Economic,
}

impl Layer {
    pub const ALL: [Layer; 4] = [
        Layer::HardData,
        Layer::Technical,
        Layer::Behavioral,
        Layer::Economic,
    ];

    /// Stable storage key
    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::HardData => "hard_data",
            Layer::Technical => "technical",
            Layer::Behavioral => "behavioral",
            Layer::Economic => "economic",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hard_data" | "harddata" => Some(Layer::HardData),
            "technical" => Some(Layer::Technical),
            "behavioral" | "sam" => Some(Layer::Behavioral),
            "economic" => Some(Layer::Economic),
            _ => None,
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse market-state label partitioning calibration history
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    RiskOn,
    RiskOff,
    #[default]
    Neutral,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::RiskOn => "risk_on",
            Regime::RiskOff => "risk_off",
            Regime::Neutral => "neutral",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "risk_on" => Some(Regime::RiskOn),
            "risk_off" => Some(Regime::RiskOff),
            "neutral" => Some(Regime::Neutral),
            _ => None,
        }
    }

    /// Derive the regime from the macro and behavioral layers.
    ///
    /// Risk-off wins over risk-on: a collapsing behavioral reading overrides
    /// a supportive macro backdrop.
    pub fn from_layers(scores: &LayerScores) -> Self {
        let economic = &scores.economic;
        let behavioral = &scores.behavioral;

        let fear_dominant = behavioral.available && behavioral.score <= -40.0;
        if fear_dominant || (economic.available && economic.score <= -20.0) {
            return Regime::RiskOff;
        }
        if economic.available && economic.score >= 20.0 {
            return Regime::RiskOn;
        }
        Regime::Neutral
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Directional call, both predicted and realized
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
    #[default]
    Neutral,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Neutral => "neutral",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "up" => Some(Direction::Up),
            "down" => Some(Direction::Down),
            "neutral" => Some(Direction::Neutral),
            _ => None,
        }
    }

    /// Classify a percentage return with a symmetric neutral band.
    pub fn from_return(return_pct: f64, threshold_pct: f64) -> Self {
        if return_pct > threshold_pct {
            Direction::Up
        } else if return_pct < -threshold_pct {
            Direction::Down
        } else {
            Direction::Neutral
        }
    }

    /// Classify a layer score with a symmetric dead band.
    pub fn from_score(score: f64, band: f64) -> Self {
        Self::from_return(score, band)
    }

    /// +1 / -1 / 0 multiplier for signed returns
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Up => 1.0,
            Direction::Down => -1.0,
            Direction::Neutral => 0.0,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "UP"),
            Direction::Down => write!(f, "DOWN"),
            Direction::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Bucketed recommendation derived from the composite score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalAction {
    StrongBuy,
    Buy,
    Neutral,
    Sell,
    StrongSell,
}

impl SignalAction {
    pub const ALL: [SignalAction; 5] = [
        SignalAction::StrongBuy,
        SignalAction::Buy,
        SignalAction::Neutral,
        SignalAction::Sell,
        SignalAction::StrongSell,
    ];

    /// Bucket a composite score; an exact zero is the only neutral reading.
    pub fn from_score(score: f64, strong_threshold: f64) -> Self {
        if score > strong_threshold {
            SignalAction::StrongBuy
        } else if score > 0.0 {
            SignalAction::Buy
        } else if score < -strong_threshold {
            SignalAction::StrongSell
        } else if score < 0.0 {
            SignalAction::Sell
        } else {
            SignalAction::Neutral
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            SignalAction::StrongBuy | SignalAction::Buy => Direction::Up,
            SignalAction::Neutral => Direction::Neutral,
            SignalAction::Sell | SignalAction::StrongSell => Direction::Down,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::StrongBuy => "STRONG_BUY",
            SignalAction::Buy => "BUY",
            SignalAction::Neutral => "NEUTRAL",
            SignalAction::Sell => "SELL",
            SignalAction::StrongSell => "STRONG_SELL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "STRONG_BUY" => Some(SignalAction::StrongBuy),
            "BUY" => Some(SignalAction::Buy),
            "NEUTRAL" => Some(SignalAction::Neutral),
            "SELL" => Some(SignalAction::Sell),
            "STRONG_SELL" => Some(SignalAction::StrongSell),
            _ => None,
        }
    }
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a ledger row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionStatus {
    Pending,
    Correct,
    Incorrect,
    Expired,
}

impl PredictionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionStatus::Pending => "pending",
            PredictionStatus::Correct => "correct",
            PredictionStatus::Incorrect => "incorrect",
            PredictionStatus::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PredictionStatus::Pending),
            "correct" => Some(PredictionStatus::Correct),
            "incorrect" => Some(PredictionStatus::Incorrect),
            "expired" => Some(PredictionStatus::Expired),
            _ => None,
        }
    }

    /// Counted in accuracy denominators
    pub fn is_scored(&self) -> bool {
        matches!(self, PredictionStatus::Correct | PredictionStatus::Incorrect)
    }
}

impl fmt::Display for PredictionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Normalized reading of one evidence layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerScore {
    /// Directional score in [-100, 100]
    pub score: f64,
    /// Confidence in [0, 100]
    pub confidence: f64,
    /// Human-readable evidence, strongest first
    pub signals: Vec<String>,
    /// Normalized weight applied in the fusion run, in [0, 1]
    pub weight: f64,
    /// False when the upstream feed was missing or stale
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

impl LayerScore {
    pub fn new(score: f64, confidence: f64, signals: Vec<String>) -> Self {
        Self {
            score: score.clamp(-100.0, 100.0),
            confidence: confidence.clamp(0.0, 100.0),
            signals,
            weight: 0.0,
            available: true,
        }
    }

    /// Degraded reading for a missing or stale feed
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            confidence: 0.0,
            signals: vec![format!("data unavailable: {}", reason.into())],
            weight: 0.0,
            available: false,
        }
    }
}

/// The four layer readings of one fusion run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerScores {
    pub hard_data: LayerScore,
    pub technical: LayerScore,
    pub behavioral: LayerScore,
    pub economic: LayerScore,
}

impl LayerScores {
    pub fn get(&self, layer: Layer) -> &LayerScore {
        match layer {
            Layer::HardData => &self.hard_data,
            Layer::Technical => &self.technical,
            Layer::Behavioral => &self.behavioral,
            Layer::Economic => &self.economic,
        }
    }

    pub fn get_mut(&mut self, layer: Layer) -> &mut LayerScore {
        match layer {
            Layer::HardData => &mut self.hard_data,
            Layer::Technical => &mut self.technical,
            Layer::Behavioral => &mut self.behavioral,
            Layer::Economic => &mut self.economic,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Layer, &LayerScore)> {
        Layer::ALL.into_iter().map(move |layer| (layer, self.get(layer)))
    }

    pub fn available_count(&self) -> usize {
        self.iter().filter(|(_, s)| s.available).count()
    }
}

/// Bullish / bearish / uncertainty evidence surfaced to the dashboard
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyFactors {
    pub bullish: Vec<String>,
    pub bearish: Vec<String>,
    pub uncertainty: Vec<String>,
}

/// Realized result written once by the outcome resolver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionOutcome {
    pub price_at_target: f64,
    pub actual_return_pct: f64,
    pub actual_direction: Direction,
    pub prediction_correct: bool,
    pub resolved_at: DateTime<Utc>,
}

/// Central fact row of the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketPrediction {
    /// Ledger row id (0 before insertion)
    pub id: i64,
    pub symbol: String,
    pub prediction_date: DateTime<Utc>,
    pub horizon_days: u32,
    pub target_date: DateTime<Utc>,
    pub direction: Direction,
    pub action: SignalAction,
    pub direction_probability: f64,
    pub confidence: f64,
    pub price_at_prediction: f64,
    pub regime: Regime,
    pub session: SessionState,
    pub layer_breakdown: LayerScores,
    /// Version of the weight record used by the fuser
    pub weights_version: i64,
    pub key_factors: KeyFactors,
    pub status: PredictionStatus,
    pub outcome: Option<PredictionOutcome>,
    pub learning_processed_at: Option<DateTime<Utc>>,
    pub pattern_processed_at: Option<DateTime<Utc>>,
}

impl MarketPrediction {
    /// Number of available layers whose own call agrees with the prediction
    pub fn layer_agreement(&self, band: f64) -> usize {
        if self.direction == Direction::Neutral {
            return 0;
        }
        self.layer_breakdown
            .iter()
            .filter(|(_, s)| s.available && Direction::from_score(s.score, band) == self.direction)
            .count()
    }

    /// Realized return signed by the predicted direction
    pub fn directional_return(&self) -> Option<f64> {
        self.outcome.as_ref().map(|o| match self.direction {
            Direction::Neutral => -o.actual_return_pct.abs(),
            d => d.sign() * o.actual_return_pct,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_bucketing_boundaries() {
        assert_eq!(SignalAction::from_score(30.1, 30.0), SignalAction::StrongBuy);
        assert_eq!(SignalAction::from_score(30.0, 30.0), SignalAction::Buy);
        assert_eq!(SignalAction::from_score(0.0001, 30.0), SignalAction::Buy);
        assert_eq!(SignalAction::from_score(0.0, 30.0), SignalAction::Neutral);
        assert_eq!(SignalAction::from_score(-0.0, 30.0), SignalAction::Neutral);
        assert_eq!(SignalAction::from_score(-30.0, 30.0), SignalAction::Sell);
        assert_eq!(SignalAction::from_score(-30.5, 30.0), SignalAction::StrongSell);
    }

    #[test]
    fn test_direction_from_return() {
        assert_eq!(Direction::from_return(2.0, 1.0), Direction::Up);
        assert_eq!(Direction::from_return(0.3, 1.0), Direction::Neutral);
        assert_eq!(Direction::from_return(-1.5, 1.0), Direction::Down);
        assert_eq!(Direction::from_return(1.0, 1.0), Direction::Neutral);
    }

    #[test]
    fn test_layer_round_trip_keys() {
        for layer in Layer::ALL {
            assert_eq!(Layer::from_str(layer.as_str()), Some(layer));
        }
        assert_eq!(Layer::from_str("sam"), Some(Layer::Behavioral));
        assert_eq!(Layer::from_str("astrology"), None);
    }

    #[test]
    fn test_regime_from_layers() {
        let mut scores = LayerScores {
            hard_data: LayerScore::new(10.0, 50.0, vec![]),
            technical: LayerScore::new(10.0, 50.0, vec![]),
            behavioral: LayerScore::new(0.0, 50.0, vec![]),
            economic: LayerScore::new(25.0, 50.0, vec![]),
        };
        assert_eq!(Regime::from_layers(&scores), Regime::RiskOn);

        scores.behavioral = LayerScore::new(-55.0, 60.0, vec![]);
        assert_eq!(Regime::from_layers(&scores), Regime::RiskOff);

        scores.behavioral = LayerScore::new(0.0, 50.0, vec![]);
        scores.economic = LayerScore::unavailable("feed down");
        assert_eq!(Regime::from_layers(&scores), Regime::Neutral);
    }

    #[test]
    fn test_unavailable_layer_is_degraded() {
        let s = LayerScore::unavailable("stale");
        assert!(!s.available);
        assert_eq!(s.confidence, 0.0);
        assert!(s.signals[0].contains("stale"));
    }
}
