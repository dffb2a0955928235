//! Trading Session Classifier
//!
//! Maps a wall-clock instant to a named window of the trading day. Each
//! window carries a static prior (multiplier, win rate, volatility, volume)
//! that realized session performance can later override.

pub mod calendar;

pub use calendar::{MarketCalendar, NyseCalendar};

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

/// Named window of the trading day (New York wall clock)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    PreMarket,
    LondonOpen,
    LondonAm,
    NyPremarket,
    NyAmPowerHour,
    NyMidday,
    NyPmPowerHour,
    AfterHours,
    Closed,
}

/// Intraday windows in order: (state, start minute, end minute)
const INTRADAY_WINDOWS: [(SessionState, u32, u32); 8] = [
    (SessionState::PreMarket, 0, 180),
    (SessionState::LondonOpen, 180, 240),
    (SessionState::LondonAm, 240, 420),
    (SessionState::NyPremarket, 420, 570),
    (SessionState::NyAmPowerHour, 570, 630),
    (SessionState::NyMidday, 630, 900),
    (SessionState::NyPmPowerHour, 900, 960),
    (SessionState::AfterHours, 960, 1200),
];

impl SessionState {
    pub const ALL: [SessionState; 9] = [
        SessionState::PreMarket,
        SessionState::LondonOpen,
        SessionState::LondonAm,
        SessionState::NyPremarket,
        SessionState::NyAmPowerHour,
        SessionState::NyMidday,
        SessionState::NyPmPowerHour,
        SessionState::AfterHours,
        SessionState::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::PreMarket => "pre_market",
            SessionState::LondonOpen => "london_open",
            SessionState::LondonAm => "london_am",
            SessionState::NyPremarket => "ny_premarket",
            SessionState::NyAmPowerHour => "ny_am_power_hour",
            SessionState::NyMidday => "ny_midday",
            SessionState::NyPmPowerHour => "ny_pm_power_hour",
            SessionState::AfterHours => "after_hours",
            SessionState::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == s)
    }

    /// Window for a local time on a trading day
    fn from_local_minute(minute_of_day: u32) -> Self {
        INTRADAY_WINDOWS
            .iter()
            .find(|(_, start, end)| (*start..*end).contains(&minute_of_day))
            .map(|(state, _, _)| *state)
            .unwrap_or(SessionState::Closed)
    }

    /// Static historical prior for this window
    pub fn static_prior(&self) -> SessionProfile {
        // (multiplier, win_rate, avg_volatility %, avg_volume, optimal)
        let (multiplier, win_rate, volatility, volume, optimal) = match self {
            SessionState::PreMarket => (0.70, 0.48, 0.6, 0.2, false),
            SessionState::LondonOpen => (1.10, 0.58, 1.1, 0.6, true),
            SessionState::LondonAm => (0.95, 0.54, 0.9, 0.5, false),
            SessionState::NyPremarket => (0.85, 0.52, 1.0, 0.4, false),
            SessionState::NyAmPowerHour => (1.30, 0.68, 1.6, 1.0, true),
            SessionState::NyMidday => (0.80, 0.50, 0.8, 0.6, false),
            SessionState::NyPmPowerHour => (1.20, 0.62, 1.4, 0.9, true),
            SessionState::AfterHours => (0.60, 0.46, 0.7, 0.2, false),
            SessionState::Closed => (0.50, 0.45, 0.5, 0.0, false),
        };
        SessionProfile {
            state: *self,
            signal_multiplier: multiplier,
            win_rate,
            avg_volatility: volatility,
            avg_volume: volume,
            is_optimal_trading: optimal,
            prior_samples: 0,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Prior attached to a session window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionProfile {
    pub state: SessionState,
    /// Confidence multiplier in (0, 1.5]
    pub signal_multiplier: f64,
    /// Historical win rate prior
    pub win_rate: f64,
    /// Typical move in percent, drives stop-loss / take-profit
    pub avg_volatility: f64,
    /// Relative volume (1.0 = busiest window)
    pub avg_volume: f64,
    pub is_optimal_trading: bool,
    /// Resolved trades behind `win_rate` (0 = static prior)
    pub prior_samples: u64,
}

/// Realized win rates per session, loaded from the ledger aggregate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionPriors {
    realized: HashMap<SessionState, (f64, u64)>,
}

impl SessionPriors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, state: SessionState, win_rate: f64, samples: u64) {
        self.realized.insert(state, (win_rate.clamp(0.0, 1.0), samples));
    }

    pub fn get(&self, state: SessionState) -> Option<(f64, u64)> {
        self.realized.get(&state).copied()
    }
}

/// Current-time session read model for the dashboard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAnalysis {
    pub timestamp: DateTime<Utc>,
    pub local_time: Option<NaiveDateTime>,
    pub session: SessionState,
    pub profile: SessionProfile,
    pub next_session: Option<SessionState>,
    pub minutes_to_next: Option<u32>,
    /// Set when the calendar could not be consulted
    pub calendar_error: Option<String>,
}

/// Session classifier
#[derive(Debug, Clone)]
pub struct SessionClassifier {
    priors: SessionPriors,
    /// Realized samples needed before a prior replaces the static win rate
    min_prior_samples: u64,
}

impl Default for SessionClassifier {
    fn default() -> Self {
        Self::new(30)
    }
}

impl SessionClassifier {
    pub fn new(min_prior_samples: u64) -> Self {
        Self {
            priors: SessionPriors::new(),
            min_prior_samples,
        }
    }

    pub fn with_priors(mut self, priors: SessionPriors) -> Self {
        self.priors = priors;
        self
    }

    pub fn set_priors(&mut self, priors: SessionPriors) {
        self.priors = priors;
    }

    /// Pure classification. Without a usable calendar the answer is `Closed`.
    pub fn classify(ts: DateTime<Utc>, calendar: Option<&dyn MarketCalendar>) -> SessionState {
        match Self::try_classify(ts, calendar) {
            Ok((state, _)) => state,
            Err(reason) => {
                warn!(%ts, reason = %reason, "Calendar unavailable, treating session as closed");
                SessionState::Closed
            }
        }
    }

    fn try_classify(
        ts: DateTime<Utc>,
        calendar: Option<&dyn MarketCalendar>,
    ) -> Result<(SessionState, NaiveDateTime), String> {
        let calendar = calendar.ok_or_else(|| "no calendar configured".to_string())?;
        let local = calendar.local_time(ts).map_err(|e| e.to_string())?;
        let trading_day = calendar
            .is_trading_day(local.date())
            .map_err(|e| e.to_string())?;
        if !trading_day {
            return Ok((SessionState::Closed, local));
        }
        let minute = local.hour() * 60 + local.minute();
        Ok((SessionState::from_local_minute(minute), local))
    }

    /// Prior for a session, realized win rate applied once well sampled
    pub fn profile(&self, state: SessionState) -> SessionProfile {
        let mut profile = state.static_prior();
        if let Some((win_rate, samples)) = self.priors.get(state) {
            if samples >= self.min_prior_samples {
                profile.win_rate = win_rate;
                profile.prior_samples = samples;
            }
        }
        profile
    }

    /// Profile for an instant; calendar failure yields a non-optimal closed profile
    pub fn profile_at(
        &self,
        ts: DateTime<Utc>,
        calendar: Option<&dyn MarketCalendar>,
    ) -> SessionProfile {
        self.profile(Self::classify(ts, calendar))
    }

    /// Session analysis for the read endpoint
    pub fn analyze(
        &self,
        ts: DateTime<Utc>,
        calendar: Option<&dyn MarketCalendar>,
    ) -> SessionAnalysis {
        match Self::try_classify(ts, calendar) {
            Ok((state, local)) => {
                let (next_session, minutes_to_next) = if state == SessionState::Closed {
                    (None, None)
                } else {
                    let minute = local.hour() * 60 + local.minute();
                    next_window(minute)
                };
                SessionAnalysis {
                    timestamp: ts,
                    local_time: Some(local),
                    session: state,
                    profile: self.profile(state),
                    next_session,
                    minutes_to_next,
                    calendar_error: None,
                }
            }
            Err(reason) => {
                warn!(%ts, reason = %reason, "Calendar unavailable, treating session as closed");
                SessionAnalysis {
                    timestamp: ts,
                    local_time: None,
                    session: SessionState::Closed,
                    profile: self.profile(SessionState::Closed),
                    next_session: None,
                    minutes_to_next: None,
                    calendar_error: Some(reason),
                }
            }
        }
    }
}

fn next_window(minute_of_day: u32) -> (Option<SessionState>, Option<u32>) {
    INTRADAY_WINDOWS
        .iter()
        .find(|(_, start, end)| (*start..*end).contains(&minute_of_day))
        .map(|(_, _, end)| {
            let next = SessionState::from_local_minute(*end);
            (Some(next), Some(end - minute_of_day))
        })
        .unwrap_or((None, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, EngineResult};
    use chrono::{NaiveDate, TimeZone};

    struct BrokenCalendar;

    impl MarketCalendar for BrokenCalendar {
        fn local_time(&self, _ts: DateTime<Utc>) -> EngineResult<NaiveDateTime> {
            Err(EngineError::Calendar("calendar service down".into()))
        }

        fn is_trading_day(&self, _date: NaiveDate) -> EngineResult<bool> {
            Err(EngineError::Calendar("calendar service down".into()))
        }
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_classify_intraday_windows_in_summer() {
        let cal = NyseCalendar::new();
        // 2026-10-13 is a Tuesday, EDT (UTC-4)
        let cases = [
            (5, 0, SessionState::PreMarket),
            (7, 30, SessionState::LondonOpen),
            (9, 0, SessionState::LondonAm),
            (12, 0, SessionState::NyPremarket),
            (13, 30, SessionState::NyAmPowerHour),
            (16, 0, SessionState::NyMidday),
            (19, 59, SessionState::NyPmPowerHour),
            (20, 0, SessionState::AfterHours),
            (23, 30, SessionState::AfterHours),
            (1, 0, SessionState::Closed),
        ];
        for (h, m, expected) in cases {
            let ts = utc(2026, 10, 13, h, m);
            assert_eq!(
                SessionClassifier::classify(ts, Some(&cal)),
                expected,
                "at {:02}:{:02} UTC",
                h,
                m
            );
        }
    }

    #[test]
    fn test_classify_respects_winter_offset() {
        let cal = NyseCalendar::new();
        // 2026-01-13 is a Tuesday, EST (UTC-5): 14:30 UTC = 09:30 local
        let ts = utc(2026, 1, 13, 14, 30);
        assert_eq!(
            SessionClassifier::classify(ts, Some(&cal)),
            SessionState::NyAmPowerHour
        );
    }

    #[test]
    fn test_weekend_and_holiday_are_closed() {
        let cal = NyseCalendar::new();
        let sunday = utc(2026, 10, 18, 14, 0);
        let thanksgiving = utc(2026, 11, 26, 15, 0);
        assert_eq!(SessionClassifier::classify(sunday, Some(&cal)), SessionState::Closed);
        assert_eq!(
            SessionClassifier::classify(thanksgiving, Some(&cal)),
            SessionState::Closed
        );
    }

    #[test]
    fn test_calendar_failure_is_closed_and_not_optimal() {
        let classifier = SessionClassifier::default();
        let ts = utc(2026, 10, 13, 13, 45);
        assert_eq!(
            SessionClassifier::classify(ts, Some(&BrokenCalendar)),
            SessionState::Closed
        );
        assert_eq!(SessionClassifier::classify(ts, None), SessionState::Closed);

        let analysis = classifier.analyze(ts, Some(&BrokenCalendar));
        assert_eq!(analysis.session, SessionState::Closed);
        assert!(!analysis.profile.is_optimal_trading);
        assert!(analysis.calendar_error.is_some());
    }

    #[test]
    fn test_realized_priors_override_after_min_samples() {
        let mut priors = SessionPriors::new();
        priors.set(SessionState::NyMidday, 0.61, 10);
        priors.set(SessionState::NyAmPowerHour, 0.55, 40);
        let classifier = SessionClassifier::new(30).with_priors(priors);

        assert_eq!(classifier.profile(SessionState::NyMidday).win_rate, 0.50);
        let power = classifier.profile(SessionState::NyAmPowerHour);
        assert_eq!(power.win_rate, 0.55);
        assert_eq!(power.prior_samples, 40);
        assert_eq!(power.signal_multiplier, 1.30);
    }

    #[test]
    fn test_analysis_reports_next_window() {
        let cal = NyseCalendar::new();
        let classifier = SessionClassifier::default();
        // 10:00 local EDT, 30 minutes before midday
        let analysis = classifier.analyze(utc(2026, 10, 13, 14, 0), Some(&cal));
        assert_eq!(analysis.session, SessionState::NyAmPowerHour);
        assert_eq!(analysis.next_session, Some(SessionState::NyMidday));
        assert_eq!(analysis.minutes_to_next, Some(30));
    }

    #[test]
    fn test_multipliers_within_bounds() {
        for state in SessionState::ALL {
            let m = state.static_prior().signal_multiplier;
            assert!(m > 0.0 && m <= 1.5, "{} multiplier {}", state, m);
        }
    }
}
