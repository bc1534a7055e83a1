//! Zero Screener Library
//!
//! Concurrent surge screener: scans a market universe once per run, grades
//! every instrument into alert tiers from its recent bars, and keeps a
//! persistent discovery history (first/last seen, streaks, running maxima).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        ScreeningEngine                              │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  UniverseProvider ──► TaskOrchestrator (bounded workers, deadline)  │
//! │                           │ per instrument                          │
//! │                           ▼                                         │
//! │  IndicatorSource ─► IndicatorCalculator ─► SignalClassifier         │
//! │  (cache, retry)                                  │ tier A/B/C        │
//! │                                                  ▼                  │
//! │                                           HistoryStore (upsert)     │
//! └─────────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                 ScreeningReport ──► Notifier
//! ```
//!
//! # Tiers
//!
//! - **A**: strong breakout, highest score and the tightest gate
//! - **B**: momentum near the 20-day high with heavy volume
//! - **C**: early accumulation, modest move on rising volume
//!
//! A tier whose gate fails degrades to the next one down.
//!
//! # Strategies
//!
//! `strategy.kind` picks the per-instrument rule. `surge` (default) grades
//! into the tiers above. `ma_threshold` keeps every instrument closing at
//! least `ma_threshold_pct` above MA20, optionally on heavy volume, and
//! reports them untiered. Both feed the same orchestrator and history store.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod classifier;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod history;
pub mod indicators;
pub mod notification;
pub mod orchestrator;

pub use classifier::{
    ClassificationCriteria, MaThresholdFilter, SignalClassifier, SignalGrade, Tier,
};
pub use config::{ScreenerConfig, ScreeningStrategy};
pub use engine::{ScreeningEngine, ScreeningMode, ScreeningReport, ScreeningResult};
pub use error::{FetchError, ScreenerError, StoreError};
pub use history::{HistoryStore, MemoryHistoryStore, RunContext, SqliteHistoryStore};
pub use indicators::{IndicatorCalculator, IndicatorSet, InsufficientData};
pub use orchestrator::{ProcessingResult, TaskError, TaskOrchestrator};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use zero_common::Validate;

use crate::config::StorageBackend;
use crate::data::{
    CachedSource, IndicatorSource, JsonWatchList, RetryPolicy, RetryingSource, SnapshotSource,
};
use crate::notification::{JsonFileNotifier, LogNotifier, Notifier};

type SnapshotCache = CachedSource<RetryingSource<Arc<SnapshotSource>>>;

/// Screener service: the engine wired to the configured snapshot, store,
/// watch list and notifier.
pub struct ScreenerService {
    config: ScreenerConfig,
    universe: Arc<SnapshotSource>,
    cache: Option<Arc<SnapshotCache>>,
    engine: ScreeningEngine,
}

impl ScreenerService {
    /// Validate the configuration and build every component.
    pub fn new(config: ScreenerConfig) -> Result<Self> {
        config.validate().map_err(ScreenerError::from)?;

        let snapshot = Arc::new(
            SnapshotSource::open(&config.snapshot_dir).context("Failed to open snapshot")?,
        );

        let retrying = RetryingSource::new(snapshot.clone(), RetryPolicy::from(&config.retry));
        let (source, cache) = if config.cache.enabled {
            let cache: Arc<SnapshotCache> = Arc::new(CachedSource::new(retrying, &config.cache));
            (cache.clone() as Arc<dyn IndicatorSource>, Some(cache))
        } else {
            (Arc::new(retrying) as Arc<dyn IndicatorSource>, None)
        };

        let store: Arc<dyn HistoryStore> = match config.storage.backend {
            StorageBackend::Sqlite => Arc::new(
                SqliteHistoryStore::open(
                    &config.storage.db_path,
                    Duration::from_millis(config.storage.busy_timeout_ms),
                )
                .map_err(ScreenerError::from)
                .context("Failed to open history database")?,
            ),
            StorageBackend::Memory => Arc::new(MemoryHistoryStore::new()),
        };

        let watchlist =
            JsonWatchList::load(&config.watchlist_path).context("Failed to load watch list")?;
        info!(
            snapshot = %config.snapshot_dir.display(),
            watched = watchlist.len(),
            backend = ?config.storage.backend,
            strategy = ?config.strategy.kind,
            "Screener components ready"
        );

        let notifier: Arc<dyn Notifier> = match &config.report_path {
            Some(path) => Arc::new(JsonFileNotifier::new(path)),
            None => Arc::new(LogNotifier),
        };

        let engine = ScreeningEngine::new(&config, source, store)
            .with_watchlist(Arc::new(watchlist))
            .with_notifier(notifier);

        Ok(Self {
            config,
            universe: snapshot,
            cache,
            engine,
        })
    }

    pub fn config(&self) -> &ScreenerConfig {
        &self.config
    }

    pub fn engine(&self) -> &ScreeningEngine {
        &self.engine
    }

    /// Cancel the in-flight run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.engine.cancellation_token()
    }

    /// Drop every cached bar window so the next run rereads the snapshot.
    /// Returns how many entries were dropped.
    pub fn clear_cache(&self) -> usize {
        let dropped = self.cache.as_ref().map_or(0, |cache| cache.clear());
        info!(dropped, "Bar cache cleared");
        dropped
    }

    /// Screen the configured market for `run_date` under a fresh run id.
    ///
    /// Expired cache entries are purged before the run starts.
    pub async fn run_once(&self, run_date: NaiveDate) -> Result<ScreeningReport> {
        if let Some(cache) = &self.cache {
            let purged = cache.clear_expired();
            if purged > 0 {
                debug!(purged, "Purged expired bar cache entries");
            }
        }

        let run = RunContext::new(run_date);
        let report = self
            .engine
            .run_market(self.universe.as_ref(), &self.config.market, &run)
            .await?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;

    fn write_snapshot(dir: &Path) {
        std::fs::create_dir_all(dir.join("bars")).unwrap();
        std::fs::write(
            dir.join("universe.json"),
            r#"[{"id": "005930", "name": "Samsung Electronics", "market": "KOSPI"}]"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("bars").join("005930.json"),
            r#"[{"date": "2024-01-10", "open": 1, "high": 2, "low": 0.5, "close": 1.5, "volume": 10}]"#,
        )
        .unwrap();
    }

    fn service(dir: &Path, cache_enabled: bool) -> ScreenerService {
        let mut config = ScreenerConfig::default();
        config.snapshot_dir = dir.to_path_buf();
        config.watchlist_path = dir.join("watchlist.json");
        config.storage.backend = StorageBackend::Memory;
        config.cache.enabled = cache_enabled;
        ScreenerService::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_run_once_then_clear_cache() {
        let dir = tempdir().unwrap();
        write_snapshot(dir.path());
        let service = service(dir.path(), true);

        let report = service
            .run_once(NaiveDate::from_ymd_opt(2024, 1, 10).unwrap())
            .await
            .unwrap();
        assert_eq!(report.total_instruments, 1);
        assert_eq!(report.skipped.insufficient_data, 1);

        assert_eq!(service.clear_cache(), 1);
        assert_eq!(service.clear_cache(), 0);
    }

    #[tokio::test]
    async fn test_clear_cache_without_cache_is_noop() {
        let dir = tempdir().unwrap();
        write_snapshot(dir.path());
        let service = service(dir.path(), false);
        assert_eq!(service.clear_cache(), 0);
    }

    #[test]
    fn test_missing_snapshot_is_fatal() {
        let dir = tempdir().unwrap();
        let mut config = ScreenerConfig::default();
        config.snapshot_dir = dir.path().join("absent");
        config.storage.backend = StorageBackend::Memory;
        assert!(ScreenerService::new(config).is_err());
    }
}
