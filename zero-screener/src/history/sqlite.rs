//! SQLite history backend.
//!
//! Every upsert runs in one `BEGIN IMMEDIATE` transaction, so the
//! read-modify-write is atomic even against writers in other processes
//! sharing the database file.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    week_start, DailyLogEntry, HistoryRecord, HistoryStatistics, HistoryStore, HistoryUpdateInfo,
    RunContext,
};
use crate::engine::ScreeningResult;
use crate::error::StoreError;

// ============================================================================
// Database Schema
// ============================================================================

const CREATE_TABLES_SQL: &str = r#"
-- One row per instrument that ever qualified
CREATE TABLE IF NOT EXISTS history (
    instrument_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    first_seen_date TEXT NOT NULL,
    last_seen_date TEXT NOT NULL,
    total_times_seen INTEGER NOT NULL DEFAULT 1,
    consecutive_streak INTEGER NOT NULL DEFAULT 1,
    max_return_seen REAL NOT NULL,
    max_price_seen REAL NOT NULL,
    last_run_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_history_last_seen
ON history(last_seen_date);

CREATE INDEX IF NOT EXISTS idx_history_total
ON history(total_times_seen DESC);

-- Append-only sightings, one per instrument and run
CREATE TABLE IF NOT EXISTS daily_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    instrument_id TEXT NOT NULL REFERENCES history(instrument_id),
    run_id TEXT NOT NULL,
    date TEXT NOT NULL,
    price REAL NOT NULL,
    return_pct REAL NOT NULL,
    volume REAL NOT NULL,
    logged_at TEXT NOT NULL,
    UNIQUE(instrument_id, run_id)
);

CREATE INDEX IF NOT EXISTS idx_daily_log_instrument_date
ON daily_log(instrument_id, date);
"#;

const DATE_FORMAT: &str = "%Y-%m-%d";

const RECORD_COLUMNS: &str = "instrument_id, name, first_seen_date, last_seen_date, \
     total_times_seen, consecutive_streak, max_return_seen, max_price_seen, last_run_id, \
     created_at, updated_at";

// ============================================================================
// SQLite History Store
// ============================================================================

/// SQLite-backed history store.
pub struct SqliteHistoryStore {
    /// rusqlite::Connection is Send but not Sync, hence the Mutex
    db: Arc<Mutex<Connection>>,
    db_path: Option<PathBuf>,
}

impl SqliteHistoryStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self::init(conn, busy_timeout, Some(path.to_path_buf()))?;
        info!(db_path = %path.display(), "Initialized history store");
        Ok(store)
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, Duration::from_secs(5), None)
    }

    fn init(
        conn: Connection,
        busy_timeout: Duration,
        db_path: Option<PathBuf>,
    ) -> Result<Self, StoreError> {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        conn.execute_batch(CREATE_TABLES_SQL)?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            db_path,
        })
    }

    /// Get the database path (`None` for in-memory stores)
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn load_record(conn: &Connection, instrument_id: &str) -> rusqlite::Result<Option<HistoryRecord>> {
        conn.query_row(
            &format!("SELECT {} FROM history WHERE instrument_id = ?1", RECORD_COLUMNS),
            params![instrument_id],
            Self::row_to_record,
        )
        .optional()
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
        Ok(HistoryRecord {
            instrument_id: row.get(0)?,
            name: row.get(1)?,
            first_seen_date: date_column(row, 2)?,
            last_seen_date: date_column(row, 3)?,
            total_times_seen: row.get(4)?,
            consecutive_streak: row.get(5)?,
            max_return_seen: row.get(6)?,
            max_price_seen: row.get(7)?,
            last_run_id: row.get(8)?,
            created_at: timestamp_column(row, 9)?,
            updated_at: timestamp_column(row, 10)?,
        })
    }

    fn row_to_log_entry(row: &Row<'_>) -> rusqlite::Result<DailyLogEntry> {
        Ok(DailyLogEntry {
            instrument_id: row.get(0)?,
            run_id: row.get(1)?,
            date: date_column(row, 2)?,
            price: row.get(3)?,
            return_pct: row.get(4)?,
            volume: row.get(5)?,
            logged_at: timestamp_column(row, 6)?,
        })
    }
}

fn date_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, DATE_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn date_text(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn upsert(
        &self,
        result: &ScreeningResult,
        run: &RunContext,
    ) -> Result<HistoryUpdateInfo, StoreError> {
        let mut db = self.db.lock().await;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let replayed = tx
            .query_row(
                "SELECT 1 FROM daily_log WHERE instrument_id = ?1 AND run_id = ?2",
                params![result.instrument_id, run.run_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        let existing = Self::load_record(&tx, &result.instrument_id)?;

        if replayed {
            if let Some(record) = existing {
                debug!(instrument = %result.instrument_id, run_id = %run.run_id, "Replayed upsert ignored");
                return Ok(record.update_info(false));
            }
        }

        let now = Utc::now();
        let is_new = existing.is_none();
        let record = match existing {
            Some(mut record) => {
                record.advance(result, run, now);
                record
            }
            None => HistoryRecord::first(result, run, now),
        };

        tx.execute(
            &format!(
                r#"
                INSERT INTO history ({})
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT(instrument_id) DO UPDATE SET
                    name = excluded.name,
                    first_seen_date = excluded.first_seen_date,
                    last_seen_date = excluded.last_seen_date,
                    total_times_seen = excluded.total_times_seen,
                    consecutive_streak = excluded.consecutive_streak,
                    max_return_seen = excluded.max_return_seen,
                    max_price_seen = excluded.max_price_seen,
                    last_run_id = excluded.last_run_id,
                    updated_at = excluded.updated_at
                "#,
                RECORD_COLUMNS
            ),
            params![
                record.instrument_id,
                record.name,
                date_text(record.first_seen_date),
                date_text(record.last_seen_date),
                record.total_times_seen,
                record.consecutive_streak,
                record.max_return_seen,
                record.max_price_seen,
                record.last_run_id,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )?;

        let entry = DailyLogEntry::new(result, run, now);
        tx.execute(
            r#"
            INSERT INTO daily_log
            (instrument_id, run_id, date, price, return_pct, volume, logged_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                entry.instrument_id,
                entry.run_id,
                date_text(entry.date),
                entry.price,
                entry.return_pct,
                entry.volume,
                entry.logged_at.to_rfc3339(),
            ],
        )?;

        tx.commit()?;

        debug!(
            instrument = %record.instrument_id,
            total = record.total_times_seen,
            streak = record.consecutive_streak,
            is_new,
            "History updated"
        );
        Ok(record.update_info(is_new))
    }

    async fn get(&self, instrument_id: &str) -> Result<Option<HistoryRecord>, StoreError> {
        let db = self.db.lock().await;
        Ok(Self::load_record(&db, instrument_id)?)
    }

    async fn list(&self, limit: usize) -> Result<Vec<HistoryRecord>, StoreError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM history \
             ORDER BY total_times_seen DESC, last_seen_date DESC, instrument_id ASC \
             LIMIT ?1",
            RECORD_COLUMNS
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let records = stmt
            .query_map(params![limit], Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    async fn daily_log(
        &self,
        instrument_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyLogEntry>, StoreError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            r#"
            SELECT instrument_id, run_id, date, price, return_pct, volume, logged_at
            FROM daily_log
            WHERE instrument_id = ?1 AND date >= ?2 AND date <= ?3
            ORDER BY date ASC, id ASC
            "#,
        )?;
        let entries = stmt
            .query_map(
                params![instrument_id, date_text(start), date_text(end)],
                Self::row_to_log_entry,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    async fn get_statistics(
        &self,
        as_of: NaiveDate,
        min_streak: u32,
    ) -> Result<HistoryStatistics, StoreError> {
        let db = self.db.lock().await;
        let (total, today, week, streak): (i64, i64, i64, i64) = db.query_row(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN last_seen_date = ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN first_seen_date >= ?2 AND first_seen_date <= ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN consecutive_streak >= ?3 THEN 1 ELSE 0 END), 0)
            FROM history
            "#,
            params![date_text(as_of), date_text(week_start(as_of)), min_streak],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        Ok(HistoryStatistics {
            discovered_today: today as usize,
            new_this_week: week as usize,
            streak_at_least_n: streak as usize,
            total_instruments: total as usize,
        })
    }
}
