//! Discovery history.
//!
//! Keeps one record per instrument that ever qualified (first/last seen,
//! totals, streak, running maxima) plus an append-only daily log of every
//! sighting. Upserts are idempotent per run: replaying the same run id
//! returns the stored state and appends nothing.
//!
//! Both backends share the pure transition in [`HistoryRecord::advance`];
//! locking lives inside each backend.

mod memory;
mod sqlite;

pub use memory::MemoryHistoryStore;
pub use sqlite::SqliteHistoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::engine::ScreeningResult;
use crate::error::StoreError;

// ============================================================================
// Run Context
// ============================================================================

/// Identifies one screening run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: String,
    pub run_date: NaiveDate,
}

impl RunContext {
    /// New run with a fresh id.
    pub fn new(run_date: NaiveDate) -> Self {
        Self {
            run_id: zero_common::logging::generate_run_id(),
            run_date,
        }
    }

    /// Run with a caller-chosen id, e.g. when replaying a run.
    pub fn with_id(run_id: impl Into<String>, run_date: NaiveDate) -> Self {
        Self {
            run_id: run_id.into(),
            run_date,
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// Persisted discovery state for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub instrument_id: String,
    pub name: String,
    pub first_seen_date: NaiveDate,
    pub last_seen_date: NaiveDate,
    pub total_times_seen: u32,
    pub consecutive_streak: u32,
    pub max_return_seen: f64,
    pub max_price_seen: f64,
    pub last_run_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HistoryRecord {
    /// Record for an instrument seen for the first time.
    pub fn first(result: &ScreeningResult, run: &RunContext, now: DateTime<Utc>) -> Self {
        Self {
            instrument_id: result.instrument_id.clone(),
            name: result.name.clone(),
            first_seen_date: run.run_date,
            last_seen_date: run.run_date,
            total_times_seen: 1,
            consecutive_streak: 1,
            max_return_seen: result.today_return_pct,
            max_price_seen: result.price,
            last_run_id: run.run_id.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply one new sighting from a run not yet recorded.
    ///
    /// Streak: a gap of one day extends it, the same day keeps it, a longer
    /// gap restarts it at 1. A run date older than `last_seen_date` is a
    /// backfill and leaves the streak and `last_seen_date` alone.
    pub fn advance(&mut self, result: &ScreeningResult, run: &RunContext, now: DateTime<Utc>) {
        let gap = (run.run_date - self.last_seen_date).num_days();
        if gap > 0 {
            self.consecutive_streak = if gap == 1 {
                self.consecutive_streak + 1
            } else {
                1
            };
            self.last_seen_date = run.run_date;
        }
        self.first_seen_date = self.first_seen_date.min(run.run_date);

        self.total_times_seen += 1;
        self.max_return_seen = self.max_return_seen.max(result.today_return_pct);
        self.max_price_seen = self.max_price_seen.max(result.price);
        self.name = result.name.clone();
        self.last_run_id = run.run_id.clone();
        self.updated_at = now;
    }

    pub fn update_info(&self, is_new: bool) -> HistoryUpdateInfo {
        HistoryUpdateInfo {
            is_new,
            first_seen_date: self.first_seen_date,
            total_times_seen: self.total_times_seen,
            consecutive_streak: self.consecutive_streak,
        }
    }
}

/// One sighting in the append-only daily log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyLogEntry {
    pub instrument_id: String,
    pub run_id: String,
    pub date: NaiveDate,
    pub price: f64,
    pub return_pct: f64,
    pub volume: f64,
    pub logged_at: DateTime<Utc>,
}

impl DailyLogEntry {
    pub fn new(result: &ScreeningResult, run: &RunContext, now: DateTime<Utc>) -> Self {
        Self {
            instrument_id: result.instrument_id.clone(),
            run_id: run.run_id.clone(),
            date: run.run_date,
            price: result.price,
            return_pct: result.today_return_pct,
            volume: result.volume,
            logged_at: now,
        }
    }
}

/// History summary merged into a screening result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryUpdateInfo {
    pub is_new: bool,
    pub first_seen_date: NaiveDate,
    pub total_times_seen: u32,
    pub consecutive_streak: u32,
}

/// Aggregate counts over the whole history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryStatistics {
    /// Last seen on `as_of`
    pub discovered_today: usize,
    /// First seen on or after `as_of - 7 days`
    pub new_this_week: usize,
    /// Streak at or above the requested minimum
    pub streak_at_least_n: usize,
    pub total_instruments: usize,
}

/// Inclusive lower bound of the "new this week" window: one week before
/// `as_of`, so an instrument first seen exactly 7 days earlier still counts.
pub(crate) fn week_start(as_of: NaiveDate) -> NaiveDate {
    as_of - Duration::days(7)
}

// ============================================================================
// Store Trait
// ============================================================================

/// Persisted keyed aggregation of discovery state.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Record one sighting atomically and return the resulting summary.
    ///
    /// Replaying a run id already logged for the instrument is a no-op that
    /// returns the stored summary with `is_new == false`.
    async fn upsert(
        &self,
        result: &ScreeningResult,
        run: &RunContext,
    ) -> Result<HistoryUpdateInfo, StoreError>;

    async fn get(&self, instrument_id: &str) -> Result<Option<HistoryRecord>, StoreError>;

    /// Records ordered by total sightings, most frequent first.
    async fn list(&self, limit: usize) -> Result<Vec<HistoryRecord>, StoreError>;

    /// Daily log entries for one instrument within `[start, end]`, oldest first.
    async fn daily_log(
        &self,
        instrument_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyLogEntry>, StoreError>;

    async fn get_statistics(
        &self,
        as_of: NaiveDate,
        min_streak: u32,
    ) -> Result<HistoryStatistics, StoreError>;
}

#[async_trait]
impl<S: HistoryStore + ?Sized> HistoryStore for Arc<S> {
    async fn upsert(
        &self,
        result: &ScreeningResult,
        run: &RunContext,
    ) -> Result<HistoryUpdateInfo, StoreError> {
        (**self).upsert(result, run).await
    }

    async fn get(&self, instrument_id: &str) -> Result<Option<HistoryRecord>, StoreError> {
        (**self).get(instrument_id).await
    }

    async fn list(&self, limit: usize) -> Result<Vec<HistoryRecord>, StoreError> {
        (**self).list(limit).await
    }

    async fn daily_log(
        &self,
        instrument_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyLogEntry>, StoreError> {
        (**self).daily_log(instrument_id, start, end).await
    }

    async fn get_statistics(
        &self,
        as_of: NaiveDate,
        min_streak: u32,
    ) -> Result<HistoryStatistics, StoreError> {
        (**self).get_statistics(as_of, min_streak).await
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{date, result};
    use super::*;

    fn run(id: &str, d: NaiveDate) -> RunContext {
        RunContext::with_id(id, d)
    }

    #[test]
    fn test_streak_transitions() {
        let now = Utc::now();
        let mut record = HistoryRecord::first(&result("X", 100.0, 3.0), &run("r1", date(2024, 1, 10)), now);
        assert_eq!(record.consecutive_streak, 1);

        record.advance(&result("X", 101.0, 2.0), &run("r2", date(2024, 1, 11)), now);
        assert_eq!((record.total_times_seen, record.consecutive_streak), (2, 2));

        // Same day, new run: total grows, streak holds
        record.advance(&result("X", 99.0, 1.0), &run("r3", date(2024, 1, 11)), now);
        assert_eq!((record.total_times_seen, record.consecutive_streak), (3, 2));

        record.advance(&result("X", 90.0, 1.0), &run("r4", date(2024, 1, 15)), now);
        assert_eq!((record.total_times_seen, record.consecutive_streak), (4, 1));
        assert_eq!(record.last_seen_date, date(2024, 1, 15));
        assert_eq!(record.max_price_seen, 101.0);
        assert_eq!(record.max_return_seen, 3.0);
        assert_eq!(record.last_run_id, "r4");
    }

    #[test]
    fn test_backfill_keeps_streak_and_last_seen() {
        let now = Utc::now();
        let mut record = HistoryRecord::first(&result("X", 100.0, 3.0), &run("r1", date(2024, 1, 10)), now);
        record.advance(&result("X", 100.0, 3.0), &run("r2", date(2024, 1, 11)), now);

        record.advance(&result("X", 100.0, 3.0), &run("old", date(2024, 1, 5)), now);
        assert_eq!(record.total_times_seen, 3);
        assert_eq!(record.consecutive_streak, 2);
        assert_eq!(record.last_seen_date, date(2024, 1, 11));
        assert_eq!(record.first_seen_date, date(2024, 1, 5));
    }

    #[test]
    fn test_week_start() {
        assert_eq!(week_start(date(2024, 1, 15)), date(2024, 1, 8));
    }

    #[test]
    fn test_run_context_ids_are_unique() {
        let d = date(2024, 1, 10);
        assert_ne!(RunContext::new(d).run_id, RunContext::new(d).run_id);
    }
}
