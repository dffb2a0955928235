//! CSV Persistence Module
//!
//! Daily price history files (`prices/prices_{YYYY-MM-DD}.csv`) used as a
//! realized-price source, and flat CSV audit exports of the prediction ledger.

use chrono::{DateTime, NaiveDate, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{debug, info};

use crate::error::EngineResult;
use crate::types::{Layer, MarketPrediction};

/// Price tick record for CSV storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    /// Unix millis
    pub timestamp: i64,
    pub symbol: String,
    pub price: f64,
    pub source: String,
}

impl PriceRecord {
    pub fn new(symbol: &str, at: DateTime<Utc>, price: f64, source: &str) -> Self {
        Self {
            timestamp: at.timestamp_millis(),
            symbol: symbol.to_string(),
            price,
            source: source.to_string(),
        }
    }
}

/// One flattened ledger row for offline analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionAuditRecord {
    pub id: i64,
    pub symbol: String,
    pub prediction_date: String,
    pub target_date: String,
    pub horizon_days: u32,
    pub direction: String,
    pub action: String,
    pub direction_probability: f64,
    pub confidence: f64,
    pub price_at_prediction: f64,
    pub regime: String,
    pub session: String,
    pub weights_version: i64,
    pub status: String,
    pub hard_data_score: Option<f64>,
    pub technical_score: Option<f64>,
    pub behavioral_score: Option<f64>,
    pub economic_score: Option<f64>,
    pub price_at_target: Option<f64>,
    pub actual_return_pct: Option<f64>,
    pub actual_direction: Option<String>,
    pub prediction_correct: Option<bool>,
}

impl From<&MarketPrediction> for PredictionAuditRecord {
    fn from(p: &MarketPrediction) -> Self {
        let layer = |l: Layer| {
            let s = p.layer_breakdown.get(l);
            s.available.then_some(s.score)
        };
        Self {
            id: p.id,
            symbol: p.symbol.clone(),
            prediction_date: p.prediction_date.to_rfc3339(),
            target_date: p.target_date.to_rfc3339(),
            horizon_days: p.horizon_days,
            direction: p.direction.to_string(),
            action: p.action.to_string(),
            direction_probability: p.direction_probability,
            confidence: p.confidence,
            price_at_prediction: p.price_at_prediction,
            regime: p.regime.to_string(),
            session: p.session.to_string(),
            weights_version: p.weights_version,
            status: p.status.to_string(),
            hard_data_score: layer(Layer::HardData),
            technical_score: layer(Layer::Technical),
            behavioral_score: layer(Layer::Behavioral),
            economic_score: layer(Layer::Economic),
            price_at_target: p.outcome.as_ref().map(|o| o.price_at_target),
            actual_return_pct: p.outcome.as_ref().map(|o| o.actual_return_pct),
            actual_direction: p.outcome.as_ref().map(|o| o.actual_direction.to_string()),
            prediction_correct: p.outcome.as_ref().map(|o| o.prediction_correct),
        }
    }
}

/// Writer bound to the file of one calendar day
struct DailyWriter {
    day: NaiveDate,
    writer: csv::Writer<std::fs::File>,
}

/// CSV persistence manager
pub struct CsvPersistence {
    data_dir: PathBuf,
    price_writer: AsyncRwLock<Option<DailyWriter>>,
}

impl CsvPersistence {
    /// Create a new CSV persistence manager
    pub fn new(data_dir: impl AsRef<Path>) -> EngineResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();

        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(data_dir.join("prices"))?;
        fs::create_dir_all(data_dir.join("exports"))?;

        Ok(Self {
            data_dir,
            price_writer: AsyncRwLock::new(None),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.data_dir.join("exports")
    }

    fn price_file(&self, day: NaiveDate) -> PathBuf {
        self.data_dir
            .join("prices")
            .join(format!("prices_{}.csv", day.format("%Y-%m-%d")))
    }

    fn create_writer(path: &Path) -> EngineResult<csv::Writer<std::fs::File>> {
        let file_has_data =
            path.exists() && fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .append(true)
            .open(path)?;

        let writer = WriterBuilder::new()
            .has_headers(!file_has_data)
            .from_writer(file);

        Ok(writer)
    }

    /// Append a price tick to the file of the tick's own day
    pub async fn save_price(&self, record: PriceRecord) -> EngineResult<()> {
        let day = DateTime::<Utc>::from_timestamp_millis(record.timestamp)
            .unwrap_or_else(Utc::now)
            .date_naive();

        let mut guard = self.price_writer.write().await;
        if guard.as_ref().map(|w| w.day) != Some(day) {
            if let Some(mut previous) = guard.take() {
                previous.writer.flush()?;
            }
            let path = self.price_file(day);
            debug!(path = %path.display(), "Opening price file");
            *guard = Some(DailyWriter {
                day,
                writer: Self::create_writer(&path)?,
            });
        }

        if let Some(current) = guard.as_mut() {
            current.writer.serialize(&record)?;
            current.writer.flush()?;
        }
        Ok(())
    }

    /// Ticks for `symbol` with `from <= timestamp <= to`, oldest first
    pub fn load_price_window(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> EngineResult<Vec<PriceRecord>> {
        let mut records = Vec::new();
        if from > to {
            return Ok(records);
        }

        let (from_ms, to_ms) = (from.timestamp_millis(), to.timestamp_millis());
        let mut day = from.date_naive();
        let last_day = to.date_naive();

        while day <= last_day {
            let path = self.price_file(day);
            if path.exists() {
                let file = std::fs::File::open(&path)?;
                let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);

                for result in reader.deserialize() {
                    let record: PriceRecord = result?;
                    if record.symbol == symbol
                        && record.timestamp >= from_ms
                        && record.timestamp <= to_ms
                    {
                        records.push(record);
                    }
                }
            }
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }

        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }

    /// Export ledger rows for analysis; returns the number of rows written
    pub fn export_predictions(
        &self,
        predictions: &[MarketPrediction],
        output_path: impl AsRef<Path>,
    ) -> EngineResult<usize> {
        let output_path = output_path.as_ref();
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(output_path)?;

        let mut writer = WriterBuilder::new().has_headers(true).from_writer(file);

        for prediction in predictions {
            writer.serialize(PredictionAuditRecord::from(prediction))?;
        }

        writer.flush()?;
        info!(
            "Exported {} predictions to {}",
            predictions.len(),
            output_path.display()
        );

        Ok(predictions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use crate::types::{
        Direction, KeyFactors, LayerScore, LayerScores, PredictionOutcome, PredictionStatus,
        Regime, SignalAction,
    };
    use chrono::{Duration, TimeZone};

    fn temp_data_dir(test_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "signalfuse_persistence_{}_{}",
            test_name,
            uuid::Uuid::new_v4()
        ))
    }

    #[tokio::test]
    async fn save_price_rolls_files_by_tick_day() {
        let data_dir = temp_data_dir("roll");
        let persistence = CsvPersistence::new(&data_dir).unwrap();
        let day1 = Utc.with_ymd_and_hms(2026, 10, 12, 20, 0, 0).unwrap();
        let day2 = day1 + Duration::days(1);

        persistence
            .save_price(PriceRecord::new("SPY", day1, 580.0, "test"))
            .await
            .unwrap();
        persistence
            .save_price(PriceRecord::new("QQQ", day1, 490.0, "test"))
            .await
            .unwrap();
        persistence
            .save_price(PriceRecord::new("SPY", day2, 583.5, "test"))
            .await
            .unwrap();

        let f1 = data_dir.join("prices").join("prices_2026-10-12.csv");
        let f2 = data_dir.join("prices").join("prices_2026-10-13.csv");
        let content = fs::read_to_string(&f1).unwrap();
        assert!(content.starts_with("timestamp,symbol,price,source"));
        assert_eq!(content.lines().count(), 3);
        assert_eq!(fs::read_to_string(&f2).unwrap().lines().count(), 2);

        let window = persistence
            .load_price_window("SPY", day1 - Duration::hours(1), day2)
            .unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[1].price, 583.5);

        let narrow = persistence
            .load_price_window("SPY", day1 - Duration::hours(1), day1 + Duration::hours(1))
            .unwrap();
        assert_eq!(narrow.len(), 1);

        let _ = fs::remove_dir_all(&data_dir);
    }

    #[tokio::test]
    async fn reopening_existing_file_does_not_repeat_header() {
        let data_dir = temp_data_dir("reopen");
        let at = Utc.with_ymd_and_hms(2026, 10, 12, 15, 0, 0).unwrap();
        {
            let persistence = CsvPersistence::new(&data_dir).unwrap();
            persistence
                .save_price(PriceRecord::new("SPY", at, 580.0, "test"))
                .await
                .unwrap();
        }
        let persistence = CsvPersistence::new(&data_dir).unwrap();
        persistence
            .save_price(PriceRecord::new("SPY", at + Duration::minutes(5), 581.0, "test"))
            .await
            .unwrap();

        let content =
            fs::read_to_string(data_dir.join("prices").join("prices_2026-10-12.csv")).unwrap();
        assert_eq!(content.matches("timestamp").count(), 1);
        assert_eq!(
            persistence
                .load_price_window("SPY", at, at + Duration::hours(1))
                .unwrap()
                .len(),
            2
        );

        let _ = fs::remove_dir_all(&data_dir);
    }

    #[test]
    fn export_predictions_flattens_outcome() {
        let data_dir = temp_data_dir("export");
        let persistence = CsvPersistence::new(&data_dir).unwrap();
        let at = Utc.with_ymd_and_hms(2026, 10, 12, 14, 0, 0).unwrap();

        let mut layers = LayerScores {
            hard_data: LayerScore::new(40.0, 80.0, vec![]),
            technical: LayerScore::new(10.0, 60.0, vec![]),
            behavioral: LayerScore::unavailable("feed down"),
            economic: LayerScore::new(-5.0, 50.0, vec![]),
        };
        layers.hard_data.weight = 0.4;
        let prediction = MarketPrediction {
            id: 7,
            symbol: "SPY".into(),
            prediction_date: at,
            horizon_days: 1,
            target_date: at + Duration::days(1),
            direction: Direction::Up,
            action: SignalAction::Buy,
            direction_probability: 0.6,
            confidence: 65.0,
            price_at_prediction: 100.0,
            regime: Regime::Neutral,
            session: SessionState::NyAmPowerHour,
            layer_breakdown: layers,
            weights_version: 3,
            key_factors: KeyFactors::default(),
            status: PredictionStatus::Correct,
            outcome: Some(PredictionOutcome {
                price_at_target: 102.0,
                actual_return_pct: 2.0,
                actual_direction: Direction::Up,
                prediction_correct: true,
                resolved_at: at + Duration::days(1),
            }),
            learning_processed_at: None,
            pattern_processed_at: None,
        };

        let out = persistence.exports_dir().join("predictions.csv");
        assert_eq!(
            persistence
                .export_predictions(&[prediction], &out)
                .unwrap(),
            1
        );

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .from_path(&out)
            .unwrap();
        let row: PredictionAuditRecord = reader.deserialize().next().unwrap().unwrap();
        assert_eq!(row.id, 7);
        assert_eq!(row.behavioral_score, None);
        assert_eq!(row.hard_data_score, Some(40.0));
        assert_eq!(row.prediction_correct, Some(true));
        assert_eq!(row.status, "correct");

        let _ = fs::remove_dir_all(&data_dir);
    }
}
