//! Concurrency tests for the history backends.
//!
//! Many simultaneous upserts for one instrument must leave exactly one
//! record whose totals match the number of distinct runs, also while other
//! instruments are written at the same time.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::task::JoinSet;

use zero_screener::classifier::Tier;
use zero_screener::engine::{ScreeningMode, ScreeningResult};
use zero_screener::history::{HistoryStore, MemoryHistoryStore, RunContext, SqliteHistoryStore};

const UPSERTS: usize = 1000;
const INSTRUMENTS: [&str; 4] = ["005930", "000660", "035720", "051910"];
const RUNS_PER_INSTRUMENT: usize = 150;

fn result_for(instrument_id: &str, price: f64) -> ScreeningResult {
    ScreeningResult {
        instrument_id: instrument_id.to_string(),
        name: format!("Instrument {}", instrument_id),
        market: "KOSPI".to_string(),
        tier: Tier::A,
        score: 9,
        price,
        today_return_pct: 5.0,
        ma20_gap_pct: 6.0,
        volume: 1_000_000.0,
        reasons: vec!["20-day high breakout".to_string()],
        mode: ScreeningMode::Initial,
        history: None,
    }
}

fn result(price: f64) -> ScreeningResult {
    result_for("005930", price)
}

fn run_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()
}

/// Fire `UPSERTS` upserts spread over the given stores; returns how many
/// reported `is_new`.
async fn hammer(stores: Vec<Arc<dyn HistoryStore>>, distinct_runs: bool) -> usize {
    let mut tasks = JoinSet::new();
    for i in 0..UPSERTS {
        let store = stores[i % stores.len()].clone();
        tasks.spawn(async move {
            let run = if distinct_runs {
                RunContext::with_id(format!("run-{}", i), run_date())
            } else {
                RunContext::with_id("shared-run", run_date())
            };
            store.upsert(&result(i as f64), &run).await
        });
    }

    let mut new_count = 0;
    while let Some(joined) = tasks.join_next().await {
        if joined.unwrap().unwrap().is_new {
            new_count += 1;
        }
    }
    new_count
}

async fn assert_single_record(store: &dyn HistoryStore, expected_total: u32) {
    let listed = store.list(10).await.unwrap();
    assert_eq!(listed.len(), 1);
    let record = &listed[0];
    assert_eq!(record.total_times_seen, expected_total);
    assert_eq!(record.consecutive_streak, 1);

    let log = store
        .daily_log("005930", run_date(), run_date())
        .await
        .unwrap();
    assert_eq!(log.len(), expected_total as usize);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_concurrent_distinct_runs() {
    let store = Arc::new(MemoryHistoryStore::new());
    let new_count = hammer(vec![store.clone() as Arc<dyn HistoryStore>], true).await;

    assert_eq!(new_count, 1);
    assert_single_record(store.as_ref(), UPSERTS as u32).await;
    let record = store.get("005930").await.unwrap().unwrap();
    assert_eq!(record.max_price_seen, (UPSERTS - 1) as f64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_concurrent_same_run() {
    let store = Arc::new(MemoryHistoryStore::new());
    let new_count = hammer(vec![store.clone() as Arc<dyn HistoryStore>], false).await;

    assert_eq!(new_count, 1);
    assert_single_record(store.as_ref(), 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_concurrent_distinct_runs_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.db");
    let first = Arc::new(SqliteHistoryStore::open(&path, Duration::from_secs(30)).unwrap());
    let second = Arc::new(SqliteHistoryStore::open(&path, Duration::from_secs(30)).unwrap());

    let new_count = hammer(vec![first.clone() as Arc<dyn HistoryStore>, second.clone()], true).await;

    assert_eq!(new_count, 1);
    assert_single_record(first.as_ref(), UPSERTS as u32).await;
    assert_single_record(second.as_ref(), UPSERTS as u32).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_concurrent_same_run_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.db");
    let first = Arc::new(SqliteHistoryStore::open(&path, Duration::from_secs(30)).unwrap());
    let second = Arc::new(SqliteHistoryStore::open(&path, Duration::from_secs(30)).unwrap());

    let new_count = hammer(vec![first.clone() as Arc<dyn HistoryStore>, second.clone()], false).await;

    assert_eq!(new_count, 1);
    assert_single_record(first.as_ref(), 1).await;
}

/// One upsert per (run, instrument), all in flight together. Each run id is
/// shared by every instrument, as in a real screening run.
async fn interleave(stores: Vec<Arc<dyn HistoryStore>>) {
    let mut tasks = JoinSet::new();
    let mut n = 0;
    for run in 0..RUNS_PER_INSTRUMENT {
        for id in INSTRUMENTS {
            let store = stores[n % stores.len()].clone();
            n += 1;
            tasks.spawn(async move {
                let ctx = RunContext::with_id(format!("run-{}", run), run_date());
                store.upsert(&result_for(id, run as f64), &ctx).await
            });
        }
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap().unwrap();
    }
}

async fn assert_each_instrument_counted(store: &dyn HistoryStore) {
    assert_eq!(store.list(100).await.unwrap().len(), INSTRUMENTS.len());
    for id in INSTRUMENTS {
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.total_times_seen, RUNS_PER_INSTRUMENT as u32, "{}", id);
        assert_eq!(record.max_price_seen, (RUNS_PER_INSTRUMENT - 1) as f64);

        let log = store.daily_log(id, run_date(), run_date()).await.unwrap();
        assert_eq!(log.len(), RUNS_PER_INSTRUMENT, "{}", id);
        assert!(log.iter().all(|entry| entry.instrument_id == id));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_interleaved_instruments() {
    let store = Arc::new(MemoryHistoryStore::new());
    interleave(vec![store.clone() as Arc<dyn HistoryStore>]).await;

    assert_eq!(store.len(), INSTRUMENTS.len());
    assert_each_instrument_counted(store.as_ref()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_interleaved_instruments_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.db");
    let first = Arc::new(SqliteHistoryStore::open(&path, Duration::from_secs(30)).unwrap());
    let second = Arc::new(SqliteHistoryStore::open(&path, Duration::from_secs(30)).unwrap());

    interleave(vec![first.clone() as Arc<dyn HistoryStore>, second.clone()]).await;

    assert_each_instrument_counted(first.as_ref()).await;
    assert_each_instrument_counted(second.as_ref()).await;
}
