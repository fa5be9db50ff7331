use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::collab::{HistoryProvider, SetupQuery};
use crate::position::{ClosedPosition, Position};
use crate::safety::SafetyState;
use crate::traps::learning::{FeedbackRecord, PatternWeight};

/// Persistent state the pipeline needs across restarts. Get/put/query only;
/// callers never see the storage engine.
pub trait Store: Send + Sync {
    fn put_pattern_weight(&self, weight: &PatternWeight) -> Result<()>;
    fn load_pattern_weights(&self) -> Result<Vec<PatternWeight>>;
    fn put_feedback(&self, record: &FeedbackRecord) -> Result<()>;
    /// Records whose outcome has not been written yet.
    fn load_pending_feedback(&self) -> Result<Vec<FeedbackRecord>>;
    fn put_position(&self, position: &Position) -> Result<()>;
    fn delete_position(&self, instrument_id: &str) -> Result<()>;
    fn load_positions(&self) -> Result<Vec<Position>>;
    fn put_safety(&self, state: &SafetyState) -> Result<()>;
    fn load_safety(&self) -> Result<Option<SafetyState>>;
    fn record_outcome(&self, closed: &ClosedPosition) -> Result<()>;
    /// Realized returns of closed positions whose entry scores fall within
    /// `band` of both query scores.
    fn similar_outcomes(&self, query: &SetupQuery) -> Result<Vec<f64>>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("open sqlite store at {path}"))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self { conn: Mutex::new(conn) };
        store.init()?;
        Ok(store)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init(&self) -> Result<()> {
        self.lock()
            .execute_batch(
                "BEGIN;
                CREATE TABLE IF NOT EXISTS pattern_weights (
                    pattern_id TEXT PRIMARY KEY,
                    weight_bp INTEGER NOT NULL,
                    version INTEGER NOT NULL,
                    body TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS feedback (
                    feedback_key TEXT PRIMARY KEY,
                    detected_at INTEGER NOT NULL,
                    resolved INTEGER NOT NULL,
                    body TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS positions (
                    instrument_id TEXT PRIMARY KEY,
                    body TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS safety_state (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    body TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS setup_outcomes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    instrument_id TEXT NOT NULL,
                    quant_score REAL NOT NULL,
                    ai_score REAL NOT NULL,
                    return_pct REAL NOT NULL,
                    realized_pnl REAL NOT NULL,
                    opened_at INTEGER NOT NULL,
                    closed_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_outcomes_scores ON setup_outcomes (quant_score, ai_score);
                COMMIT;",
            )
            .context("init sqlite schema")?;
        Ok(())
    }

    fn load_bodies<T: serde::de::DeserializeOwned>(&self, sql: &str) -> Result<Vec<T>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for body in rows {
            out.push(serde_json::from_str(&body?)?);
        }
        Ok(out)
    }
}

impl Store for SqliteStore {
    fn put_pattern_weight(&self, weight: &PatternWeight) -> Result<()> {
        let body = serde_json::to_string(weight)?;
        self.lock()
            .execute(
                "INSERT INTO pattern_weights (pattern_id, weight_bp, version, body) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(pattern_id) DO UPDATE SET weight_bp = ?2, version = ?3, body = ?4",
                params![weight.pattern_id.as_str(), weight.weight_bp as i64, weight.version as i64, body],
            )
            .context("put pattern weight")?;
        Ok(())
    }

    fn load_pattern_weights(&self) -> Result<Vec<PatternWeight>> {
        self.load_bodies("SELECT body FROM pattern_weights ORDER BY pattern_id")
    }

    fn put_feedback(&self, record: &FeedbackRecord) -> Result<()> {
        let body = serde_json::to_string(record)?;
        self.lock()
            .execute(
                "INSERT INTO feedback (feedback_key, detected_at, resolved, body) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(feedback_key) DO UPDATE SET resolved = ?3, body = ?4 WHERE resolved = 0",
                params![
                    record.key().storage_key(),
                    record.detected_at as i64,
                    record.is_resolved() as i64,
                    body
                ],
            )
            .context("put feedback record")?;
        Ok(())
    }

    fn load_pending_feedback(&self) -> Result<Vec<FeedbackRecord>> {
        self.load_bodies("SELECT body FROM feedback WHERE resolved = 0 ORDER BY detected_at, feedback_key")
    }

    fn put_position(&self, position: &Position) -> Result<()> {
        let body = serde_json::to_string(position)?;
        self.lock()
            .execute(
                "INSERT INTO positions (instrument_id, body) VALUES (?1, ?2)
                 ON CONFLICT(instrument_id) DO UPDATE SET body = ?2",
                params![position.instrument_id, body],
            )
            .context("put position")?;
        Ok(())
    }

    fn delete_position(&self, instrument_id: &str) -> Result<()> {
        self.lock()
            .execute("DELETE FROM positions WHERE instrument_id = ?1", params![instrument_id])
            .context("delete position")?;
        Ok(())
    }

    fn load_positions(&self) -> Result<Vec<Position>> {
        self.load_bodies("SELECT body FROM positions ORDER BY instrument_id")
    }

    fn put_safety(&self, state: &SafetyState) -> Result<()> {
        let body = serde_json::to_string(state)?;
        self.lock()
            .execute(
                "INSERT INTO safety_state (id, body) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET body = ?1",
                params![body],
            )
            .context("put safety state")?;
        Ok(())
    }

    fn load_safety(&self) -> Result<Option<SafetyState>> {
        let body: Option<String> = self
            .lock()
            .query_row("SELECT body FROM safety_state WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        match body {
            Some(b) => Ok(Some(serde_json::from_str(&b)?)),
            None => Ok(None),
        }
    }

    fn record_outcome(&self, closed: &ClosedPosition) -> Result<()> {
        self.lock()
            .execute(
                "INSERT INTO setup_outcomes
                 (instrument_id, quant_score, ai_score, return_pct, realized_pnl, opened_at, closed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    closed.instrument_id,
                    closed.entry_quant_score,
                    closed.entry_ai_score,
                    closed.return_pct,
                    closed.realized_pnl,
                    closed.opened_at as i64,
                    closed.closed_at as i64
                ],
            )
            .context("record setup outcome")?;
        Ok(())
    }

    fn similar_outcomes(&self, query: &SetupQuery) -> Result<Vec<f64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT return_pct FROM setup_outcomes
             WHERE ABS(quant_score - ?1) <= ?3 AND ABS(ai_score - ?2) <= ?3
             ORDER BY closed_at DESC",
        )?;
        let rows = stmt.query_map(params![query.quant_score, query.ai_score, query.band], |row| row.get(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

#[async_trait]
impl HistoryProvider for SqliteStore {
    async fn similar_setups(&self, query: &SetupQuery) -> Result<Vec<f64>> {
        self.similar_outcomes(query)
    }
}
