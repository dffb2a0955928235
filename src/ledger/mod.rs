//! Prediction Ledger
//!
//! SQLite store for the append-only prediction table and the aggregates
//! materialized over it: layer learning history, prediction patterns,
//! versioned fusion weights and per-session performance.
//!
//! Every state transition on a prediction is a conditional UPDATE, so a
//! second writer racing on the same row sees zero affected rows instead of
//! double-applying its effect.

pub mod prices;
pub mod resolver;

pub use prices::{CsvPriceSource, InMemoryPriceSource, PriceSource, YahooPriceSource};
pub use resolver::{OutcomeResolver, ResolveReport, ResolveResult, ResolverConfig};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::calibration::{HistoryKey, LayerLearningHistory};
use crate::error::{EngineError, EngineResult};
use crate::fusion::{LayerWeights, WeightRecord};
use crate::patterns::{PatternConditions, PredictionPattern};
use crate::session::{SessionPriors, SessionState};
use crate::types::{
    Direction, Layer, MarketPrediction, PredictionOutcome, PredictionStatus, Regime, SignalAction,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS market_predictions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    prediction_date_ms INTEGER NOT NULL,
    horizon_days INTEGER NOT NULL,
    target_date_ms INTEGER NOT NULL,
    direction TEXT NOT NULL,
    action TEXT NOT NULL,
    direction_probability REAL NOT NULL,
    confidence REAL NOT NULL,
    price_at_prediction REAL NOT NULL,
    regime TEXT NOT NULL,
    session TEXT NOT NULL,
    layer_breakdown TEXT NOT NULL,
    weights_version INTEGER NOT NULL,
    key_factors TEXT NOT NULL,
    signal_json TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    outcome TEXT,
    learning_processed_at_ms INTEGER,
    pattern_processed_at_ms INTEGER
);

CREATE INDEX IF NOT EXISTS idx_predictions_due
    ON market_predictions(status, target_date_ms);
CREATE INDEX IF NOT EXISTS idx_predictions_symbol_date
    ON market_predictions(symbol, prediction_date_ms);

CREATE TABLE IF NOT EXISTS layer_learning_history (
    layer TEXT NOT NULL,
    regime TEXT NOT NULL,
    horizon_days INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    total_predictions INTEGER NOT NULL,
    correct_predictions INTEGER NOT NULL,
    accuracy REAL NOT NULL,
    rolling_accuracy REAL NOT NULL,
    rolling_variance REAL NOT NULL,
    decay_factor REAL NOT NULL,
    avg_score_when_correct REAL NOT NULL,
    avg_score_when_wrong REAL NOT NULL,
    avg_confidence_when_correct REAL NOT NULL,
    avg_confidence_when_wrong REAL NOT NULL,
    optimal_score_threshold REAL,
    optimal_confidence_threshold REAL,
    weight_adjustment REAL NOT NULL,
    updated_at_ms INTEGER NOT NULL,
    PRIMARY KEY(layer, regime, horizon_days, symbol)
);

CREATE TABLE IF NOT EXISTS prediction_patterns (
    signature TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    conditions TEXT NOT NULL,
    occurrences INTEGER NOT NULL,
    successes INTEGER NOT NULL,
    success_rate REAL NOT NULL,
    avg_return REAL NOT NULL,
    is_active INTEGER NOT NULL,
    min_occurrences_required INTEGER NOT NULL,
    first_seen_ms INTEGER NOT NULL,
    last_seen_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS fusion_weights (
    version INTEGER PRIMARY KEY AUTOINCREMENT,
    hard_data REAL NOT NULL,
    technical REAL NOT NULL,
    behavioral REAL NOT NULL,
    economic REAL NOT NULL,
    reason TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS session_performance (
    session TEXT PRIMARY KEY,
    total_trades INTEGER NOT NULL,
    wins INTEGER NOT NULL,
    win_rate REAL NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
"#;

const PREDICTION_COLUMNS: &str = "id, symbol, prediction_date_ms, horizon_days, target_date_ms, \
     direction, action, direction_probability, confidence, price_at_prediction, regime, session, \
     layer_breakdown, weights_version, key_factors, status, outcome, \
     learning_processed_at_ms, pattern_processed_at_ms";

const HISTORY_COLUMNS: &str = "layer, regime, horizon_days, symbol, total_predictions, \
     correct_predictions, accuracy, rolling_accuracy, rolling_variance, decay_factor, \
     avg_score_when_correct, avg_score_when_wrong, avg_confidence_when_correct, \
     avg_confidence_when_wrong, optimal_score_threshold, optimal_confidence_threshold, \
     weight_adjustment, updated_at_ms";

const PATTERN_COLUMNS: &str = "signature, name, conditions, occurrences, successes, success_rate, \
     avg_return, is_active, min_occurrences_required, first_seen_ms, last_seen_ms";

/// Shared handle to the SQLite ledger
pub struct Ledger {
    conn: Mutex<Connection>,
}

impl Ledger {
    /// Open (or create) the ledger file and apply the schema
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "Ledger opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| EngineError::LockPoisoned)
    }

    /// Run `f` inside one SQLite transaction; commits only if `f` succeeds
    pub fn transaction<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&LedgerTx<'_>) -> EngineResult<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let out = f(&LedgerTx { conn: &*tx })?;
        tx.commit()?;
        Ok(out)
    }

    // ─────────────────────────────────────────────────────────────
    // Predictions
    // ─────────────────────────────────────────────────────────────

    /// Append a pending prediction; returns its row id
    pub fn append_prediction(
        &self,
        prediction: &MarketPrediction,
        signal_json: Option<&str>,
    ) -> EngineResult<i64> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO market_predictions (
                symbol, prediction_date_ms, horizon_days, target_date_ms, direction, action,
                direction_probability, confidence, price_at_prediction, regime, session,
                layer_breakdown, weights_version, key_factors, signal_json, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, 'pending')
            "#,
            params![
                prediction.symbol,
                prediction.prediction_date.timestamp_millis(),
                prediction.horizon_days as i64,
                prediction.target_date.timestamp_millis(),
                prediction.direction.as_str(),
                prediction.action.as_str(),
                prediction.direction_probability,
                prediction.confidence,
                prediction.price_at_prediction,
                prediction.regime.as_str(),
                prediction.session.as_str(),
                serde_json::to_string(&prediction.layer_breakdown)?,
                prediction.weights_version,
                serde_json::to_string(&prediction.key_factors)?,
                signal_json,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_prediction(&self, id: i64) -> EngineResult<Option<MarketPrediction>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM market_predictions WHERE id = ?1", PREDICTION_COLUMNS),
                params![id],
                RawPrediction::from_row,
            )
            .optional()?;
        raw.map(RawPrediction::into_prediction).transpose()
    }

    /// Pending predictions whose target date has passed, oldest first
    pub fn due_predictions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> EngineResult<Vec<MarketPrediction>> {
        self.query_predictions(
            "status = 'pending' AND target_date_ms <= ?1 ORDER BY target_date_ms, id LIMIT ?2",
            params![now.timestamp_millis(), limit as i64],
        )
    }

    /// Resolved predictions the calibrator has not consumed yet
    pub fn unlearned_predictions(&self, limit: usize) -> EngineResult<Vec<MarketPrediction>> {
        self.query_predictions(
            "status IN ('correct', 'incorrect') AND learning_processed_at_ms IS NULL \
             ORDER BY id LIMIT ?1",
            params![limit as i64],
        )
    }

    /// Resolved predictions the pattern detector has not consumed yet
    pub fn unpatterned_predictions(&self, limit: usize) -> EngineResult<Vec<MarketPrediction>> {
        self.query_predictions(
            "status IN ('correct', 'incorrect') AND pattern_processed_at_ms IS NULL \
             ORDER BY id LIMIT ?1",
            params![limit as i64],
        )
    }

    pub fn count_pending(&self) -> EngineResult<usize> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM market_predictions WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as usize)
    }

    /// Predictions made in `[from, to)`, optionally for one symbol
    pub fn predictions_between(
        &self,
        symbol: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> EngineResult<Vec<MarketPrediction>> {
        self.query_predictions(
            "(?1 IS NULL OR symbol = ?1) AND prediction_date_ms >= ?2 AND prediction_date_ms < ?3 \
             ORDER BY prediction_date_ms, id",
            params![
                symbol,
                from.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN),
                to.map(|t| t.timestamp_millis()).unwrap_or(i64::MAX),
            ],
        )
    }

    /// Serialized signal of the most recent fusion run for a symbol
    pub fn latest_signal_json(&self, symbol: &str) -> EngineResult<Option<String>> {
        let conn = self.lock()?;
        let json: Option<Option<String>> = conn
            .query_row(
                "SELECT signal_json FROM market_predictions WHERE symbol = ?1 \
                 ORDER BY prediction_date_ms DESC, id DESC LIMIT 1",
                params![symbol],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json.flatten())
    }

    fn query_predictions(
        &self,
        where_clause: &str,
        args: impl rusqlite::Params,
    ) -> EngineResult<Vec<MarketPrediction>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM market_predictions WHERE {}",
            PREDICTION_COLUMNS, where_clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let raws = stmt
            .query_map(args, RawPrediction::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawPrediction::into_prediction).collect()
    }

    /// Write the outcome of a pending prediction. `false` when it was no longer pending.
    pub fn record_outcome(
        &self,
        id: i64,
        outcome: &PredictionOutcome,
        status: PredictionStatus,
    ) -> EngineResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE market_predictions SET status = ?1, outcome = ?2 \
             WHERE id = ?3 AND status = 'pending'",
            params![status.as_str(), serde_json::to_string(outcome)?, id],
        )?;
        Ok(changed == 1)
    }

    /// Move a pending prediction to `expired`. `false` when it was no longer pending.
    pub fn mark_expired(&self, id: i64) -> EngineResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE market_predictions SET status = 'expired' WHERE id = ?1 AND status = 'pending'",
            params![id],
        )?;
        Ok(changed == 1)
    }

    // ─────────────────────────────────────────────────────────────
    // Learning history
    // ─────────────────────────────────────────────────────────────

    /// History rows for every layer at (symbol, regime, horizon)
    pub fn learning_histories(
        &self,
        symbol: &str,
        regime: Regime,
        horizon_days: u32,
    ) -> EngineResult<Vec<LayerLearningHistory>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM layer_learning_history \
             WHERE symbol = ?1 AND regime = ?2 AND horizon_days = ?3 ORDER BY layer",
            HISTORY_COLUMNS
        ))?;
        let raws = stmt
            .query_map(
                params![symbol, regime.as_str(), horizon_days as i64],
                RawHistory::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawHistory::into_history).collect()
    }

    // ─────────────────────────────────────────────────────────────
    // Patterns
    // ─────────────────────────────────────────────────────────────

    pub fn patterns(&self, active_only: bool) -> EngineResult<Vec<PredictionPattern>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM prediction_patterns WHERE (?1 = 0 OR is_active = 1) \
             ORDER BY occurrences DESC, signature",
            PATTERN_COLUMNS
        ))?;
        let raws = stmt
            .query_map(params![active_only as i64], RawPattern::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawPattern::into_pattern).collect()
    }

    // ─────────────────────────────────────────────────────────────
    // Weights
    // ─────────────────────────────────────────────────────────────

    /// Seed version 1 when the weight table is empty
    pub fn ensure_default_weights(
        &self,
        defaults: &LayerWeights,
        now: DateTime<Utc>,
    ) -> EngineResult<WeightRecord> {
        self.transaction(|tx| match latest_weights_on(tx.conn)? {
            Some(record) => Ok(record),
            None => tx.insert_weights(defaults, "initial defaults", now),
        })
    }

    /// Latest weight version; built-in defaults as version 0 before seeding
    pub fn latest_weights(&self) -> EngineResult<WeightRecord> {
        let conn = self.lock()?;
        Ok(latest_weights_on(&conn)?.unwrap_or_else(fallback_weights))
    }

    /// Most recent weight versions, newest first
    pub fn weight_history(&self, limit: usize) -> EngineResult<Vec<WeightRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT version, hard_data, technical, behavioral, economic, reason, created_at_ms \
             FROM fusion_weights ORDER BY version DESC LIMIT ?1",
        )?;
        let raws = stmt
            .query_map(params![limit as i64], raw_weight)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(into_weight_record).collect()
    }

    // ─────────────────────────────────────────────────────────────
    // Session performance
    // ─────────────────────────────────────────────────────────────

    /// Replace the per-session aggregate: (session, resolved trades, wins)
    pub fn save_session_stats(
        &self,
        stats: &[(SessionState, u64, u64)],
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.transaction(|tx| {
            for (session, total, wins) in stats {
                let win_rate = if *total > 0 {
                    *wins as f64 / *total as f64
                } else {
                    0.0
                };
                tx.conn.execute(
                    r#"
                    INSERT INTO session_performance (session, total_trades, wins, win_rate, updated_at_ms)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(session) DO UPDATE SET
                        total_trades = excluded.total_trades,
                        wins = excluded.wins,
                        win_rate = excluded.win_rate,
                        updated_at_ms = excluded.updated_at_ms
                    "#,
                    params![
                        session.as_str(),
                        *total as i64,
                        *wins as i64,
                        win_rate,
                        now.timestamp_millis()
                    ],
                )?;
            }
            Ok(())
        })
    }

    /// Realized win rates per session for the classifier
    pub fn session_priors(&self) -> EngineResult<SessionPriors> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT session, win_rate, total_trades FROM session_performance")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut priors = SessionPriors::new();
        for (session, win_rate, total) in rows {
            let state = SessionState::from_str(&session)
                .ok_or_else(|| EngineError::CorruptRow(format!("unknown session '{}'", session)))?;
            priors.set(state, win_rate, total.max(0) as u64);
        }
        Ok(priors)
    }
}

/// Handle passed to `Ledger::transaction` closures
pub struct LedgerTx<'a> {
    conn: &'a Connection,
}

impl LedgerTx<'_> {
    /// Atomic check-and-set of `learning_processed_at`. `false` when already set.
    pub fn claim_learning(&self, id: i64, now: DateTime<Utc>) -> EngineResult<bool> {
        let changed = self.conn.execute(
            "UPDATE market_predictions SET learning_processed_at_ms = ?1 \
             WHERE id = ?2 AND learning_processed_at_ms IS NULL \
             AND status IN ('correct', 'incorrect')",
            params![now.timestamp_millis(), id],
        )?;
        Ok(changed == 1)
    }

    /// Atomic check-and-set of `pattern_processed_at`. `false` when already set.
    pub fn claim_pattern(&self, id: i64, now: DateTime<Utc>) -> EngineResult<bool> {
        let changed = self.conn.execute(
            "UPDATE market_predictions SET pattern_processed_at_ms = ?1 \
             WHERE id = ?2 AND pattern_processed_at_ms IS NULL \
             AND status IN ('correct', 'incorrect')",
            params![now.timestamp_millis(), id],
        )?;
        Ok(changed == 1)
    }

    pub fn load_history(&self, key: &HistoryKey) -> EngineResult<Option<LayerLearningHistory>> {
        let raw = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM layer_learning_history \
                     WHERE layer = ?1 AND regime = ?2 AND horizon_days = ?3 AND symbol = ?4",
                    HISTORY_COLUMNS
                ),
                params![
                    key.layer.as_str(),
                    key.regime.as_str(),
                    key.horizon_days as i64,
                    key.symbol
                ],
                RawHistory::from_row,
            )
            .optional()?;
        raw.map(RawHistory::into_history).transpose()
    }

    pub fn save_history(&self, h: &LayerLearningHistory) -> EngineResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO layer_learning_history (
                layer, regime, horizon_days, symbol, total_predictions, correct_predictions,
                accuracy, rolling_accuracy, rolling_variance, decay_factor,
                avg_score_when_correct, avg_score_when_wrong,
                avg_confidence_when_correct, avg_confidence_when_wrong,
                optimal_score_threshold, optimal_confidence_threshold,
                weight_adjustment, updated_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            ON CONFLICT(layer, regime, horizon_days, symbol) DO UPDATE SET
                total_predictions = excluded.total_predictions,
                correct_predictions = excluded.correct_predictions,
                accuracy = excluded.accuracy,
                rolling_accuracy = excluded.rolling_accuracy,
                rolling_variance = excluded.rolling_variance,
                decay_factor = excluded.decay_factor,
                avg_score_when_correct = excluded.avg_score_when_correct,
                avg_score_when_wrong = excluded.avg_score_when_wrong,
                avg_confidence_when_correct = excluded.avg_confidence_when_correct,
                avg_confidence_when_wrong = excluded.avg_confidence_when_wrong,
                optimal_score_threshold = excluded.optimal_score_threshold,
                optimal_confidence_threshold = excluded.optimal_confidence_threshold,
                weight_adjustment = excluded.weight_adjustment,
                updated_at_ms = excluded.updated_at_ms
            "#,
            params![
                h.layer.as_str(),
                h.regime.as_str(),
                h.horizon_days as i64,
                h.symbol,
                h.total_predictions as i64,
                h.correct_predictions as i64,
                h.accuracy,
                h.rolling_accuracy,
                h.rolling_variance,
                h.decay_factor,
                h.avg_score_when_correct,
                h.avg_score_when_wrong,
                h.avg_confidence_when_correct,
                h.avg_confidence_when_wrong,
                h.optimal_score_threshold,
                h.optimal_confidence_threshold,
                h.weight_adjustment,
                h.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn load_pattern(&self, signature: &str) -> EngineResult<Option<PredictionPattern>> {
        let raw = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM prediction_patterns WHERE signature = ?1",
                    PATTERN_COLUMNS
                ),
                params![signature],
                RawPattern::from_row,
            )
            .optional()?;
        raw.map(RawPattern::into_pattern).transpose()
    }

    pub fn save_pattern(&self, p: &PredictionPattern) -> EngineResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO prediction_patterns (
                signature, name, conditions, occurrences, successes, success_rate,
                avg_return, is_active, min_occurrences_required, first_seen_ms, last_seen_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(signature) DO UPDATE SET
                occurrences = excluded.occurrences,
                successes = excluded.successes,
                success_rate = excluded.success_rate,
                avg_return = excluded.avg_return,
                is_active = excluded.is_active,
                min_occurrences_required = excluded.min_occurrences_required,
                last_seen_ms = excluded.last_seen_ms
            "#,
            params![
                p.signature,
                p.name,
                serde_json::to_string(&p.conditions)?,
                p.occurrences as i64,
                p.successes as i64,
                p.success_rate,
                p.avg_return,
                p.is_active as i64,
                p.min_occurrences_required as i64,
                p.first_seen.timestamp_millis(),
                p.last_seen.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn latest_weights(&self) -> EngineResult<WeightRecord> {
        Ok(latest_weights_on(self.conn)?.unwrap_or_else(fallback_weights))
    }

    /// Append a new weight version
    pub fn insert_weights(
        &self,
        weights: &LayerWeights,
        reason: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<WeightRecord> {
        self.conn.execute(
            "INSERT INTO fusion_weights (hard_data, technical, behavioral, economic, reason, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                weights.hard_data,
                weights.technical,
                weights.behavioral,
                weights.economic,
                reason,
                now.timestamp_millis()
            ],
        )?;
        Ok(WeightRecord {
            version: self.conn.last_insert_rowid(),
            weights: *weights,
            reason: reason.to_string(),
            created_at: now,
        })
    }
}

// ─────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────

fn from_ms(ms: i64) -> EngineResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| EngineError::CorruptRow(format!("timestamp out of range: {}", ms)))
}

fn parse_enum<T>(value: &str, what: &str, parse: fn(&str) -> Option<T>) -> EngineResult<T> {
    parse(value).ok_or_else(|| EngineError::CorruptRow(format!("unknown {} '{}'", what, value)))
}

struct RawPrediction {
    id: i64,
    symbol: String,
    prediction_date_ms: i64,
    horizon_days: i64,
    target_date_ms: i64,
    direction: String,
    action: String,
    direction_probability: f64,
    confidence: f64,
    price_at_prediction: f64,
    regime: String,
    session: String,
    layer_breakdown: String,
    weights_version: i64,
    key_factors: String,
    status: String,
    outcome: Option<String>,
    learning_processed_at_ms: Option<i64>,
    pattern_processed_at_ms: Option<i64>,
}

impl RawPrediction {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            symbol: row.get(1)?,
            prediction_date_ms: row.get(2)?,
            horizon_days: row.get(3)?,
            target_date_ms: row.get(4)?,
            direction: row.get(5)?,
            action: row.get(6)?,
            direction_probability: row.get(7)?,
            confidence: row.get(8)?,
            price_at_prediction: row.get(9)?,
            regime: row.get(10)?,
            session: row.get(11)?,
            layer_breakdown: row.get(12)?,
            weights_version: row.get(13)?,
            key_factors: row.get(14)?,
            status: row.get(15)?,
            outcome: row.get(16)?,
            learning_processed_at_ms: row.get(17)?,
            pattern_processed_at_ms: row.get(18)?,
        })
    }

    fn into_prediction(self) -> EngineResult<MarketPrediction> {
        Ok(MarketPrediction {
            id: self.id,
            prediction_date: from_ms(self.prediction_date_ms)?,
            horizon_days: u32::try_from(self.horizon_days)
                .map_err(|_| EngineError::CorruptRow(format!("horizon {}", self.horizon_days)))?,
            target_date: from_ms(self.target_date_ms)?,
            direction: parse_enum(&self.direction, "direction", Direction::from_str)?,
            action: parse_enum(&self.action, "action", SignalAction::from_str)?,
            direction_probability: self.direction_probability,
            confidence: self.confidence,
            price_at_prediction: self.price_at_prediction,
            regime: parse_enum(&self.regime, "regime", Regime::from_str)?,
            session: parse_enum(&self.session, "session", SessionState::from_str)?,
            layer_breakdown: serde_json::from_str(&self.layer_breakdown)?,
            weights_version: self.weights_version,
            key_factors: serde_json::from_str(&self.key_factors)?,
            status: parse_enum(&self.status, "status", PredictionStatus::from_str)?,
            outcome: self.outcome.as_deref().map(serde_json::from_str).transpose()?,
            learning_processed_at: self.learning_processed_at_ms.map(from_ms).transpose()?,
            pattern_processed_at: self.pattern_processed_at_ms.map(from_ms).transpose()?,
            symbol: self.symbol,
        })
    }
}

struct RawHistory {
    layer: String,
    regime: String,
    horizon_days: i64,
    symbol: String,
    total_predictions: i64,
    correct_predictions: i64,
    accuracy: f64,
    rolling_accuracy: f64,
    rolling_variance: f64,
    decay_factor: f64,
    avg_score_when_correct: f64,
    avg_score_when_wrong: f64,
    avg_confidence_when_correct: f64,
    avg_confidence_when_wrong: f64,
    optimal_score_threshold: Option<f64>,
    optimal_confidence_threshold: Option<f64>,
    weight_adjustment: f64,
    updated_at_ms: i64,
}

impl RawHistory {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            layer: row.get(0)?,
            regime: row.get(1)?,
            horizon_days: row.get(2)?,
            symbol: row.get(3)?,
            total_predictions: row.get(4)?,
            correct_predictions: row.get(5)?,
            accuracy: row.get(6)?,
            rolling_accuracy: row.get(7)?,
            rolling_variance: row.get(8)?,
            decay_factor: row.get(9)?,
            avg_score_when_correct: row.get(10)?,
            avg_score_when_wrong: row.get(11)?,
            avg_confidence_when_correct: row.get(12)?,
            avg_confidence_when_wrong: row.get(13)?,
            optimal_score_threshold: row.get(14)?,
            optimal_confidence_threshold: row.get(15)?,
            weight_adjustment: row.get(16)?,
            updated_at_ms: row.get(17)?,
        })
    }

    fn into_history(self) -> EngineResult<LayerLearningHistory> {
        Ok(LayerLearningHistory {
            layer: parse_enum(&self.layer, "layer", Layer::from_str)?,
            regime: parse_enum(&self.regime, "regime", Regime::from_str)?,
            horizon_days: self.horizon_days.max(0) as u32,
            symbol: self.symbol,
            total_predictions: self.total_predictions.max(0) as u64,
            correct_predictions: self.correct_predictions.max(0) as u64,
            accuracy: self.accuracy,
            rolling_accuracy: self.rolling_accuracy,
            rolling_variance: self.rolling_variance,
            decay_factor: self.decay_factor,
            avg_score_when_correct: self.avg_score_when_correct,
            avg_score_when_wrong: self.avg_score_when_wrong,
            avg_confidence_when_correct: self.avg_confidence_when_correct,
            avg_confidence_when_wrong: self.avg_confidence_when_wrong,
            optimal_score_threshold: self.optimal_score_threshold,
            optimal_confidence_threshold: self.optimal_confidence_threshold,
            weight_adjustment: self.weight_adjustment,
            updated_at: from_ms(self.updated_at_ms)?,
        })
    }
}

struct RawPattern {
    signature: String,
    name: String,
    conditions: String,
    occurrences: i64,
    successes: i64,
    success_rate: f64,
    avg_return: f64,
    is_active: i64,
    min_occurrences_required: i64,
    first_seen_ms: i64,
    last_seen_ms: i64,
}

impl RawPattern {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            signature: row.get(0)?,
            name: row.get(1)?,
            conditions: row.get(2)?,
            occurrences: row.get(3)?,
            successes: row.get(4)?,
            success_rate: row.get(5)?,
            avg_return: row.get(6)?,
            is_active: row.get(7)?,
            min_occurrences_required: row.get(8)?,
            first_seen_ms: row.get(9)?,
            last_seen_ms: row.get(10)?,
        })
    }

    fn into_pattern(self) -> EngineResult<PredictionPattern> {
        let conditions: PatternConditions = serde_json::from_str(&self.conditions)?;
        Ok(PredictionPattern {
            signature: self.signature,
            name: self.name,
            conditions,
            occurrences: self.occurrences.max(0) as u64,
            successes: self.successes.max(0) as u64,
            success_rate: self.success_rate,
            avg_return: self.avg_return,
            is_active: self.is_active != 0,
            min_occurrences_required: self.min_occurrences_required.max(0) as u64,
            first_seen: from_ms(self.first_seen_ms)?,
            last_seen: from_ms(self.last_seen_ms)?,
        })
    }
}

type RawWeight = (i64, f64, f64, f64, f64, String, i64);

fn raw_weight(row: &Row<'_>) -> rusqlite::Result<RawWeight> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn into_weight_record(raw: RawWeight) -> EngineResult<WeightRecord> {
    let (version, hard_data, technical, behavioral, economic, reason, created_at_ms) = raw;
    Ok(WeightRecord {
        version,
        weights: LayerWeights::new(hard_data, technical, behavioral, economic),
        reason,
        created_at: from_ms(created_at_ms)?,
    })
}

fn latest_weights_on(conn: &Connection) -> EngineResult<Option<WeightRecord>> {
    let raw = conn
        .query_row(
            "SELECT version, hard_data, technical, behavioral, economic, reason, created_at_ms \
             FROM fusion_weights ORDER BY version DESC LIMIT 1",
            [],
            raw_weight,
        )
        .optional()?;
    raw.map(into_weight_record).transpose()
}

fn fallback_weights() -> WeightRecord {
    WeightRecord {
        version: 0,
        weights: LayerWeights::default(),
        reason: "built-in defaults".to_string(),
        created_at: DateTime::<Utc>::UNIX_EPOCH,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KeyFactors, LayerScore, LayerScores};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 5, 14, 0, 0).unwrap()
    }

    fn prediction(symbol: &str, at: DateTime<Utc>) -> MarketPrediction {
        MarketPrediction {
            id: 0,
            symbol: symbol.into(),
            prediction_date: at,
            horizon_days: 1,
            target_date: at + Duration::days(1),
            direction: Direction::Up,
            action: SignalAction::StrongBuy,
            direction_probability: 0.7,
            confidence: 72.5,
            price_at_prediction: 450.0,
            regime: Regime::RiskOn,
            session: SessionState::NyAmPowerHour,
            layer_breakdown: LayerScores {
                hard_data: LayerScore::new(60.0, 80.0, vec!["flow".into()]),
                technical: LayerScore::new(30.0, 60.0, vec![]),
                behavioral: LayerScore::unavailable("stale"),
                economic: LayerScore::new(25.0, 50.0, vec![]),
            },
            weights_version: 1,
            key_factors: KeyFactors {
                bullish: vec!["hard_data: flow".into()],
                bearish: vec![],
                uncertainty: vec!["behavioral: no data".into()],
            },
            status: PredictionStatus::Pending,
            outcome: None,
            learning_processed_at: None,
            pattern_processed_at: None,
        }
    }

    fn outcome() -> PredictionOutcome {
        PredictionOutcome {
            price_at_target: 459.0,
            actual_return_pct: 2.0,
            actual_direction: Direction::Up,
            prediction_correct: true,
            resolved_at: t0() + Duration::days(1),
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let ledger = Ledger::open_in_memory().unwrap();
        let p = prediction("SPY", t0());
        let id = ledger.append_prediction(&p, Some("{}")).unwrap();
        let stored = ledger.get_prediction(id).unwrap().unwrap();
        assert_eq!(stored.id, id);
        assert_eq!(MarketPrediction { id: 0, ..stored }, p);
        assert_eq!(ledger.latest_signal_json("SPY").unwrap().as_deref(), Some("{}"));
        assert_eq!(ledger.latest_signal_json("QQQ").unwrap(), None);
    }

    #[test]
    fn test_outcome_written_once() {
        let ledger = Ledger::open_in_memory().unwrap();
        let id = ledger.append_prediction(&prediction("SPY", t0()), None).unwrap();

        assert!(ledger.record_outcome(id, &outcome(), PredictionStatus::Correct).unwrap());
        assert!(!ledger.record_outcome(id, &outcome(), PredictionStatus::Incorrect).unwrap());
        assert!(!ledger.mark_expired(id).unwrap());

        let stored = ledger.get_prediction(id).unwrap().unwrap();
        assert_eq!(stored.status, PredictionStatus::Correct);
        assert_eq!(stored.outcome, Some(outcome()));
    }

    #[test]
    fn test_due_and_range_queries() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.append_prediction(&prediction("SPY", t0()), None).unwrap();
        ledger
            .append_prediction(&prediction("QQQ", t0() + Duration::days(3)), None)
            .unwrap();

        let due = ledger.due_predictions(t0() + Duration::days(2), 100).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].symbol, "SPY");

        let spy = ledger
            .predictions_between(Some("SPY"), Some(t0()), Some(t0() + Duration::days(10)))
            .unwrap();
        assert_eq!(spy.len(), 1);
        assert_eq!(ledger.predictions_between(None, None, None).unwrap().len(), 2);
    }

    #[test]
    fn test_learning_claim_is_atomic_check_and_set() {
        let ledger = Ledger::open_in_memory().unwrap();
        let id = ledger.append_prediction(&prediction("SPY", t0()), None).unwrap();

        // Pending rows cannot be claimed
        assert!(!ledger.transaction(|tx| tx.claim_learning(id, t0())).unwrap());

        ledger.record_outcome(id, &outcome(), PredictionStatus::Correct).unwrap();
        assert_eq!(ledger.unlearned_predictions(10).unwrap().len(), 1);
        assert!(ledger.transaction(|tx| tx.claim_learning(id, t0())).unwrap());
        assert!(!ledger.transaction(|tx| tx.claim_learning(id, t0())).unwrap());
        assert!(ledger.unlearned_predictions(10).unwrap().is_empty());
        // Pattern guard is independent
        assert_eq!(ledger.unpatterned_predictions(10).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let ledger = Ledger::open_in_memory().unwrap();
        let id = ledger.append_prediction(&prediction("SPY", t0()), None).unwrap();
        ledger.record_outcome(id, &outcome(), PredictionStatus::Correct).unwrap();

        let result: EngineResult<()> = ledger.transaction(|tx| {
            tx.claim_learning(id, t0())?;
            Err(EngineError::CorruptRow("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(ledger.unlearned_predictions(10).unwrap().len(), 1);
    }

    #[test]
    fn test_weight_versions() {
        let ledger = Ledger::open_in_memory().unwrap();
        assert_eq!(ledger.latest_weights().unwrap().version, 0);

        let seeded = ledger.ensure_default_weights(&LayerWeights::default(), t0()).unwrap();
        assert_eq!(seeded.version, 1);
        // Idempotent
        assert_eq!(
            ledger.ensure_default_weights(&LayerWeights::uniform(), t0()).unwrap().version,
            1
        );

        let next = ledger
            .transaction(|tx| tx.insert_weights(&LayerWeights::uniform(), "test", t0()))
            .unwrap();
        assert_eq!(next.version, 2);
        assert_eq!(ledger.latest_weights().unwrap().weights, LayerWeights::uniform());

        let history = ledger.weight_history(10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version, 2);
    }

    #[test]
    fn test_session_priors_round_trip() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger
            .save_session_stats(
                &[(SessionState::NyMidday, 40, 22), (SessionState::Closed, 0, 0)],
                t0(),
            )
            .unwrap();
        let priors = ledger.session_priors().unwrap();
        assert_eq!(priors.get(SessionState::NyMidday), Some((0.55, 40)));
        assert_eq!(priors.get(SessionState::Closed), Some((0.0, 0)));
    }

    #[test]
    fn test_file_ledger_persists_across_opens() {
        let dir = std::env::temp_dir().join(format!("signalfuse_ledger_{}", uuid::Uuid::new_v4()));
        let path = dir.join("ledger.sqlite");
        {
            let ledger = Ledger::open(&path).unwrap();
            ledger.append_prediction(&prediction("SPY", t0()), None).unwrap();
        }
        let ledger = Ledger::open(&path).unwrap();
        assert_eq!(ledger.predictions_between(None, None, None).unwrap().len(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
