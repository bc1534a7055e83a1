//! In-process history backend.
//!
//! The DashMap entry lock serializes upserts per instrument; different
//! instruments proceed in parallel. Nothing survives the process.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;

use super::{
    week_start, DailyLogEntry, HistoryRecord, HistoryStatistics, HistoryStore, HistoryUpdateInfo,
    RunContext,
};
use crate::engine::ScreeningResult;
use crate::error::StoreError;

struct InstrumentHistory {
    record: HistoryRecord,
    runs: HashSet<String>,
    log: Vec<DailyLogEntry>,
}

/// Memory-backed history store.
#[derive(Default)]
pub struct MemoryHistoryStore {
    entries: DashMap<String, InstrumentHistory>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn upsert(
        &self,
        result: &ScreeningResult,
        run: &RunContext,
    ) -> Result<HistoryUpdateInfo, StoreError> {
        let now = Utc::now();

        match self.entries.entry(result.instrument_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let history = occupied.get_mut();
                if history.runs.contains(&run.run_id) {
                    return Ok(history.record.update_info(false));
                }
                history.record.advance(result, run, now);
                history.runs.insert(run.run_id.clone());
                history.log.push(DailyLogEntry::new(result, run, now));
                Ok(history.record.update_info(false))
            }
            Entry::Vacant(vacant) => {
                let record = HistoryRecord::first(result, run, now);
                let info = record.update_info(true);
                vacant.insert(InstrumentHistory {
                    record,
                    runs: HashSet::from([run.run_id.clone()]),
                    log: vec![DailyLogEntry::new(result, run, now)],
                });
                Ok(info)
            }
        }
    }

    async fn get(&self, instrument_id: &str) -> Result<Option<HistoryRecord>, StoreError> {
        Ok(self.entries.get(instrument_id).map(|h| h.record.clone()))
    }

    async fn list(&self, limit: usize) -> Result<Vec<HistoryRecord>, StoreError> {
        let mut records: Vec<HistoryRecord> =
            self.entries.iter().map(|h| h.record.clone()).collect();
        records.sort_by(|a, b| {
            b.total_times_seen
                .cmp(&a.total_times_seen)
                .then_with(|| b.last_seen_date.cmp(&a.last_seen_date))
                .then_with(|| a.instrument_id.cmp(&b.instrument_id))
        });
        records.truncate(limit);
        Ok(records)
    }

    async fn daily_log(
        &self,
        instrument_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyLogEntry>, StoreError> {
        let Some(history) = self.entries.get(instrument_id) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<DailyLogEntry> = history
            .log
            .iter()
            .filter(|e| e.date >= start && e.date <= end)
            .cloned()
            .collect();
        // Stable sort keeps insertion order within a day
        entries.sort_by_key(|e| e.date);
        Ok(entries)
    }

    async fn get_statistics(
        &self,
        as_of: NaiveDate,
        min_streak: u32,
    ) -> Result<HistoryStatistics, StoreError> {
        let since = week_start(as_of);
        let mut stats = HistoryStatistics::default();

        for history in self.entries.iter() {
            let record = &history.record;
            stats.total_instruments += 1;
            if record.last_seen_date == as_of {
                stats.discovered_today += 1;
            }
            if record.first_seen_date >= since && record.first_seen_date <= as_of {
                stats.new_this_week += 1;
            }
            if record.consecutive_streak >= min_streak {
                stats.streak_at_least_n += 1;
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{date, result};
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_upsert_and_replay() {
        let store = MemoryHistoryStore::new();
        let run = RunContext::with_id("r1", date(2024, 1, 10));

        let first = store.upsert(&result("A", 10.0, 1.0), &run).await.unwrap();
        assert!(first.is_new);

        let replay = store.upsert(&result("A", 99.0, 9.0), &run).await.unwrap();
        assert!(!replay.is_new);
        assert_eq!(replay.total_times_seen, 1);

        let log = store
            .daily_log("A", date(2024, 1, 1), date(2024, 1, 31))
            .await
            .unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(store.get("A").await.unwrap().unwrap().max_price_seen, 10.0);
    }

    #[tokio::test]
    async fn test_streak_sequence() {
        let store = MemoryHistoryStore::new();
        let r = result("A", 10.0, 1.0);
        store.upsert(&r, &RunContext::new(date(2024, 1, 10))).await.unwrap();
        let b = store.upsert(&r, &RunContext::new(date(2024, 1, 11))).await.unwrap();
        let c = store.upsert(&r, &RunContext::new(date(2024, 1, 15))).await.unwrap();

        assert_eq!(b.consecutive_streak, 2);
        assert_eq!((c.total_times_seen, c.consecutive_streak), (3, 1));
    }

    #[tokio::test]
    async fn test_concurrent_upserts_same_instrument() {
        let store = Arc::new(MemoryHistoryStore::new());
        let run_date = date(2024, 1, 10);

        let mut handles = Vec::new();
        for i in 0..200 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let run = RunContext::with_id(format!("run-{}", i), run_date);
                store.upsert(&result("A", i as f64, 1.0), &run).await
            }));
        }

        let mut new_count = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_new {
                new_count += 1;
            }
        }

        assert_eq!(new_count, 1);
        assert_eq!(store.len(), 1);
        let record = store.get("A").await.unwrap().unwrap();
        assert_eq!(record.total_times_seen, 200);
        assert_eq!(record.max_price_seen, 199.0);
    }

    #[tokio::test]
    async fn test_list_order_and_daily_log_range() {
        let store = MemoryHistoryStore::new();
        for d in [8, 9, 10] {
            store
                .upsert(&result("B", 1.0, 1.0), &RunContext::new(date(2024, 1, d)))
                .await
                .unwrap();
        }
        store
            .upsert(&result("A", 1.0, 1.0), &RunContext::new(date(2024, 1, 10)))
            .await
            .unwrap();
        store
            .upsert(&result("C", 1.0, 1.0), &RunContext::new(date(2024, 1, 10)))
            .await
            .unwrap();

        let ids: Vec<_> = store
            .list(10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.instrument_id)
            .collect();
        assert_eq!(ids, vec!["B", "A", "C"]);

        let log = store
            .daily_log("B", date(2024, 1, 9), date(2024, 1, 10))
            .await
            .unwrap();
        assert_eq!(log.len(), 2);
        assert!(store
            .daily_log("ZZZ", date(2024, 1, 1), date(2024, 1, 31))
            .await
            .unwrap()
            .is_empty());

        let stats = store.get_statistics(date(2024, 1, 10), 3).await.unwrap();
        assert_eq!(stats.total_instruments, 3);
        assert_eq!(stats.discovered_today, 3);
        assert_eq!(stats.new_this_week, 3);
        assert_eq!(stats.streak_at_least_n, 1);
    }

    #[tokio::test]
    async fn test_new_this_week_includes_seven_days_back() {
        let store = MemoryHistoryStore::new();
        store
            .upsert(&result("EDGE", 1.0, 1.0), &RunContext::new(date(2024, 1, 8)))
            .await
            .unwrap();
        store
            .upsert(&result("STALE", 1.0, 1.0), &RunContext::new(date(2024, 1, 7)))
            .await
            .unwrap();

        let stats = store.get_statistics(date(2024, 1, 15), 5).await.unwrap();
        assert_eq!(stats.new_this_week, 1);
        assert_eq!(stats.discovered_today, 0);
    }
}
