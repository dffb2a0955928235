//! Realized price sources used by the outcome resolver and for the
//! reference price of a new prediction.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::persistence::CsvPersistence;

/// Price series keyed by (symbol, timestamp)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Last known price at or before `at`; `None` when nothing recent enough exists
    async fn price_at(&self, symbol: &str, at: DateTime<Utc>) -> EngineResult<Option<f64>>;
}

/// Reads the daily price CSVs written by `CsvPersistence`
pub struct CsvPriceSource {
    persistence: Arc<CsvPersistence>,
    /// Oldest acceptable tick before the requested instant
    max_age: Duration,
}

impl CsvPriceSource {
    pub fn new(persistence: Arc<CsvPersistence>, max_age: Duration) -> Self {
        Self {
            persistence,
            max_age,
        }
    }
}

#[async_trait]
impl PriceSource for CsvPriceSource {
    async fn price_at(&self, symbol: &str, at: DateTime<Utc>) -> EngineResult<Option<f64>> {
        let records = self
            .persistence
            .load_price_window(symbol, at - self.max_age, at)?;
        Ok(records.last().map(|r| r.price))
    }
}

/// Yahoo Finance chart API (daily closes)
pub struct YahooPriceSource {
    client: reqwest::Client,
    base_url: String,
    max_age: Duration,
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<Quote>,
}

#[derive(Debug, Deserialize)]
struct Quote {
    #[serde(default)]
    close: Vec<Option<f64>>,
}

impl YahooPriceSource {
    pub fn new(base_url: &str, max_age: Duration) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent("Mozilla/5.0 (compatible; signalfuse/0.1)")
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_age,
        })
    }

    /// Last non-null close stamped at or before `at`
    fn last_close(body: &str, at: DateTime<Utc>) -> EngineResult<Option<f64>> {
        let parsed: ChartResponse = serde_json::from_str(body)?;
        let Some(result) = parsed.chart.result.and_then(|r| r.into_iter().next()) else {
            return Ok(None);
        };
        let Some(quote) = result.indicators.quote.into_iter().next() else {
            return Ok(None);
        };

        let cutoff = at.timestamp();
        Ok(result
            .timestamp
            .iter()
            .zip(quote.close.iter())
            .filter(|(ts, _)| **ts <= cutoff)
            .filter_map(|(_, close)| *close)
            .filter(|c| c.is_finite() && *c > 0.0)
            .last())
    }
}

#[async_trait]
impl PriceSource for YahooPriceSource {
    async fn price_at(&self, symbol: &str, at: DateTime<Utc>) -> EngineResult<Option<f64>> {
        let url = format!(
            "{}/v8/finance/chart/{}?period1={}&period2={}&interval=1d",
            self.base_url,
            symbol,
            (at - self.max_age).timestamp(),
            at.timestamp()
        );
        let endpoint = url.split('?').next().unwrap_or(url.as_str());
        debug!(symbol = %symbol, url = %endpoint, "Fetching chart");

        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            debug!(symbol = %symbol, status = %response.status(), "Chart API error");
            return Err(EngineError::PriceUnavailable {
                symbol: symbol.to_string(),
                at,
            });
        }
        let body = response.text().await?;
        Self::last_close(&body, at)
    }
}

/// In-process price series
#[derive(Default)]
pub struct InMemoryPriceSource {
    series: RwLock<HashMap<String, Vec<(DateTime<Utc>, f64)>>>,
}

impl InMemoryPriceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, symbol: &str, at: DateTime<Utc>, price: f64) {
        let mut series = self.series.write().await;
        let points = series.entry(symbol.to_string()).or_default();
        points.push((at, price));
        points.sort_by_key(|(ts, _)| *ts);
    }
}

#[async_trait]
impl PriceSource for InMemoryPriceSource {
    async fn price_at(&self, symbol: &str, at: DateTime<Utc>) -> EngineResult<Option<f64>> {
        let series = self.series.read().await;
        Ok(series.get(symbol).and_then(|points| {
            points
                .iter()
                .take_while(|(ts, _)| *ts <= at)
                .last()
                .map(|(_, p)| *p)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::PriceRecord;
    use chrono::TimeZone;

    #[test]
    fn test_parse_chart_picks_last_close_before_cutoff() {
        let body = r#"{
            "chart": {
                "result": [{
                    "timestamp": [1760016600, 1760103000, 1760362200],
                    "indicators": {"quote": [{"close": [512.1, null, 515.9]}]}
                }],
                "error": null
            }
        }"#;
        let at = Utc.timestamp_opt(1760200000, 0).unwrap();
        assert_eq!(YahooPriceSource::last_close(body, at).unwrap(), Some(512.1));

        let later = Utc.timestamp_opt(1760400000, 0).unwrap();
        assert_eq!(YahooPriceSource::last_close(body, later).unwrap(), Some(515.9));
    }

    #[test]
    fn test_parse_chart_without_result() {
        let body = r#"{"chart": {"result": null, "error": {"code": "Not Found"}}}"#;
        let at = Utc.timestamp_opt(1760200000, 0).unwrap();
        assert_eq!(YahooPriceSource::last_close(body, at).unwrap(), None);
        assert!(YahooPriceSource::last_close("<html>", at).is_err());
    }

    #[tokio::test]
    async fn test_in_memory_series_lookup() {
        let source = InMemoryPriceSource::new();
        let t = Utc.with_ymd_and_hms(2026, 10, 13, 14, 0, 0).unwrap();
        source.insert("SPY", t, 100.0).await;
        source.insert("SPY", t + Duration::days(1), 101.0).await;

        assert_eq!(source.price_at("SPY", t - Duration::hours(1)).await.unwrap(), None);
        assert_eq!(source.price_at("SPY", t + Duration::hours(5)).await.unwrap(), Some(100.0));
        assert_eq!(source.price_at("SPY", t + Duration::days(2)).await.unwrap(), Some(101.0));
        assert_eq!(source.price_at("QQQ", t).await.unwrap(), None);
    }

    #[test]
    fn test_csv_source_respects_max_age() {
        let dir = std::env::temp_dir().join(format!("signalfuse_prices_{}", uuid::Uuid::new_v4()));
        let persistence = Arc::new(CsvPersistence::new(&dir).unwrap());
        let t = Utc.with_ymd_and_hms(2026, 10, 13, 20, 0, 0).unwrap();

        tokio_test::block_on(async {
            persistence
                .save_price(PriceRecord::new("SPY", t, 512.5, "test"))
                .await
                .unwrap();

            let source = CsvPriceSource::new(persistence.clone(), Duration::hours(96));
            assert_eq!(source.price_at("SPY", t + Duration::days(1)).await.unwrap(), Some(512.5));
            assert_eq!(source.price_at("SPY", t + Duration::days(5)).await.unwrap(), None);
            assert_eq!(source.price_at("SPY", t - Duration::minutes(1)).await.unwrap(), None);
        });

        std::fs::remove_dir_all(&dir).ok();
    }
}
