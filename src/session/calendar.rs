//! Market calendar
//!
//! Converts UTC instants to New York wall-clock time (US DST rules) and
//! knows which dates the exchange is shut.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc, Weekday};
use std::collections::HashSet;

use crate::error::{EngineError, EngineResult};

/// Source of trading-day and local-time information
pub trait MarketCalendar: Send + Sync {
    /// Wall-clock time in the market's timezone
    fn local_time(&self, ts: DateTime<Utc>) -> EngineResult<NaiveDateTime>;

    /// Whether the exchange opens on this local date
    fn is_trading_day(&self, date: NaiveDate) -> EngineResult<bool>;
}

/// NYSE calendar: America/New_York offsets plus the exchange holiday rules
#[derive(Debug, Clone, Default)]
pub struct NyseCalendar {
    extra_holidays: HashSet<NaiveDate>,
}

impl NyseCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add ad-hoc closures (national days of mourning, weather, ...)
    pub fn with_extra_holidays(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            extra_holidays: dates.into_iter().collect(),
        }
    }

    /// Parse `YYYY-MM-DD` strings from configuration
    pub fn from_config(dates: &[String]) -> EngineResult<Self> {
        let mut parsed = HashSet::new();
        for raw in dates {
            let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                .map_err(|e| EngineError::Calendar(format!("bad holiday '{}': {}", raw, e)))?;
            parsed.insert(date);
        }
        Ok(Self {
            extra_holidays: parsed,
        })
    }

    /// UTC offset in hours for New York at the given instant
    pub fn utc_offset_hours(ts: DateTime<Utc>) -> EngineResult<i64> {
        let year = ts.year();
        // DST: second Sunday of March 02:00 EST -> first Sunday of November 02:00 EDT
        let start_day = nth_weekday(year, 3, Weekday::Sun, 2)?;
        let end_day = nth_weekday(year, 11, Weekday::Sun, 1)?;
        let dst_start = Utc.from_utc_datetime(&at_hour(start_day, 7)?);
        let dst_end = Utc.from_utc_datetime(&at_hour(end_day, 6)?);

        if ts >= dst_start && ts < dst_end {
            Ok(-4)
        } else {
            Ok(-5)
        }
    }

    /// Full-day exchange holidays for a year, with weekend observance applied
    pub fn holidays(year: i32) -> EngineResult<Vec<NaiveDate>> {
        let mut days = Vec::with_capacity(10);

        // New Year's Day is not moved back into the previous year
        let new_year = ymd(year, 1, 1)?;
        if new_year.weekday() == Weekday::Sun {
            days.push(new_year + Duration::days(1));
        } else if new_year.weekday() != Weekday::Sat {
            days.push(new_year);
        }

        days.push(nth_weekday(year, 1, Weekday::Mon, 3)?); // MLK
        days.push(nth_weekday(year, 2, Weekday::Mon, 3)?); // Presidents
        days.push(easter_sunday(year)? - Duration::days(2)); // Good Friday
        days.push(last_weekday(year, 5, Weekday::Mon)?); // Memorial
        if year >= 2022 {
            days.push(observed(ymd(year, 6, 19)?)); // Juneteenth
        }
        days.push(observed(ymd(year, 7, 4)?));
        days.push(nth_weekday(year, 9, Weekday::Mon, 1)?); // Labor
        days.push(nth_weekday(year, 11, Weekday::Thu, 4)?); // Thanksgiving
        days.push(observed(ymd(year, 12, 25)?));

        Ok(days)
    }
}

impl MarketCalendar for NyseCalendar {
    fn local_time(&self, ts: DateTime<Utc>) -> EngineResult<NaiveDateTime> {
        let offset = Self::utc_offset_hours(ts)?;
        Ok(ts.naive_utc() + Duration::hours(offset))
    }

    fn is_trading_day(&self, date: NaiveDate) -> EngineResult<bool> {
        if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            return Ok(false);
        }
        if self.extra_holidays.contains(&date) {
            return Ok(false);
        }
        Ok(!Self::holidays(date.year())?.contains(&date))
    }
}

fn ymd(year: i32, month: u32, day: u32) -> EngineResult<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| EngineError::Calendar(format!("invalid date {}-{}-{}", year, month, day)))
}

fn at_hour(date: NaiveDate, hour: u32) -> EngineResult<NaiveDateTime> {
    date.and_hms_opt(hour, 0, 0)
        .ok_or_else(|| EngineError::Calendar(format!("invalid hour {} on {}", hour, date)))
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u8) -> EngineResult<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n).ok_or_else(|| {
        EngineError::Calendar(format!("no {:?} #{} in {}-{}", weekday, n, year, month))
    })
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> EngineResult<NaiveDate> {
    let next_month_first = if month == 12 {
        ymd(year + 1, 1, 1)?
    } else {
        ymd(year, month + 1, 1)?
    };
    let mut day = next_month_first - Duration::days(1);
    while day.weekday() != weekday {
        day = day - Duration::days(1);
    }
    Ok(day)
}

/// Saturday holidays close on Friday, Sunday holidays on Monday
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

/// Anonymous Gregorian computus
fn easter_sunday(year: i32) -> EngineResult<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = ((h + l - 7 * m + 114) % 31) + 1;
    ymd(year, month as u32, day as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_easter_known_dates() {
        assert_eq!(easter_sunday(2024).unwrap(), ymd(2024, 3, 31).unwrap());
        assert_eq!(easter_sunday(2025).unwrap(), ymd(2025, 4, 20).unwrap());
        assert_eq!(easter_sunday(2026).unwrap(), ymd(2026, 4, 5).unwrap());
    }

    #[test]
    fn test_dst_offsets() {
        let winter = Utc.with_ymd_and_hms(2026, 1, 15, 15, 0, 0).unwrap();
        let summer = Utc.with_ymd_and_hms(2026, 7, 15, 15, 0, 0).unwrap();
        assert_eq!(NyseCalendar::utc_offset_hours(winter).unwrap(), -5);
        assert_eq!(NyseCalendar::utc_offset_hours(summer).unwrap(), -4);

        // 2026-03-08 is the second Sunday of March
        let before = Utc.with_ymd_and_hms(2026, 3, 8, 6, 59, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 3, 8, 7, 0, 0).unwrap();
        assert_eq!(NyseCalendar::utc_offset_hours(before).unwrap(), -5);
        assert_eq!(NyseCalendar::utc_offset_hours(after).unwrap(), -4);
    }

    #[test]
    fn test_holidays_and_weekends() {
        let cal = NyseCalendar::new();
        // Thanksgiving 2026
        assert!(!cal.is_trading_day(ymd(2026, 11, 26).unwrap()).unwrap());
        // Independence Day 2026 falls on Saturday, observed Friday 3rd
        assert!(!cal.is_trading_day(ymd(2026, 7, 3).unwrap()).unwrap());
        // Good Friday 2026
        assert!(!cal.is_trading_day(ymd(2026, 4, 3).unwrap()).unwrap());
        // Ordinary Tuesday
        assert!(cal.is_trading_day(ymd(2026, 10, 13).unwrap()).unwrap());
        // Sunday
        assert!(!cal.is_trading_day(ymd(2026, 10, 18).unwrap()).unwrap());
    }

    #[test]
    fn test_extra_holidays_from_config() {
        let cal = NyseCalendar::from_config(&["2026-10-13".to_string()]).unwrap();
        assert!(!cal.is_trading_day(ymd(2026, 10, 13).unwrap()).unwrap());
        assert!(NyseCalendar::from_config(&["13/10/2026".to_string()]).is_err());
    }
}
