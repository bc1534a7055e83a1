//! Bar cache for indicator sources.
//!
//! Provides in-memory caching with TTL keyed by (instrument, start, end) to
//! avoid refetching the same window within a run or across close runs.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

use super::{IndicatorSource, InstrumentBar};
use crate::config::CacheConfig;
use crate::error::FetchError;

/// Cache entry with TTL
#[derive(Debug, Clone)]
struct CacheEntry<T> {
    data: T,
    expires_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    fn new(data: T, ttl_secs: i64) -> Self {
        Self {
            data,
            expires_at: Utc::now() + Duration::seconds(ttl_secs),
        }
    }

    fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Caching decorator around any [`IndicatorSource`].
///
/// Only successful fetches are cached. A live entry is never overwritten, so
/// two workers racing on the same key both end up serving the first window.
pub struct CachedSource<S> {
    inner: S,
    bars: RwLock<HashMap<String, CacheEntry<Arc<Vec<InstrumentBar>>>>>,
    ttl_secs: i64,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<S: IndicatorSource> CachedSource<S> {
    /// Wrap `inner` with the given cache settings.
    pub fn new(inner: S, config: &CacheConfig) -> Self {
        Self {
            inner,
            bars: RwLock::new(HashMap::new()),
            ttl_secs: config.ttl_secs as i64,
            max_entries: config.max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Get cache key for a bar window
    fn bar_key(instrument_id: &str, start: NaiveDate, end: NaiveDate) -> String {
        format!("{}:{}:{}", instrument_id, start, end)
    }

    fn get_live(&self, key: &str) -> Option<Arc<Vec<InstrumentBar>>> {
        let cache = self.bars.read().ok()?;
        cache.get(key).and_then(|entry| {
            if entry.is_expired() {
                None
            } else {
                Some(Arc::clone(&entry.data))
            }
        })
    }

    fn insert(&self, key: String, bars: Arc<Vec<InstrumentBar>>) {
        let Ok(mut cache) = self.bars.write() else {
            return;
        };

        if cache.get(&key).is_some_and(|entry| !entry.is_expired()) {
            return;
        }

        if cache.len() >= self.max_entries && !cache.contains_key(&key) {
            cache.retain(|_, entry| !entry.is_expired());
            if cache.len() >= self.max_entries {
                let oldest = cache
                    .iter()
                    .min_by_key(|(_, entry)| entry.expires_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    cache.remove(&oldest);
                }
            }
        }

        cache.insert(key, CacheEntry::new(bars, self.ttl_secs));
    }

    /// Clear all expired entries. Returns how many were dropped.
    pub fn clear_expired(&self) -> usize {
        let Ok(mut cache) = self.bars.write() else {
            return 0;
        };
        let before = cache.len();
        cache.retain(|_, entry| !entry.is_expired());
        before - cache.len()
    }

    /// Drop every entry, live or not. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let Ok(mut cache) = self.bars.write() else {
            return 0;
        };
        let dropped = cache.len();
        cache.clear();
        dropped
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let (total, expired) = self
            .bars
            .read()
            .ok()
            .map(|c| {
                let total = c.len();
                let expired = c.values().filter(|e| e.is_expired()).count();
                (total, expired)
            })
            .unwrap_or((0, 0));

        CacheStats {
            total_entries: total,
            expired_entries: expired,
            active_entries: total - expired,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl<S: IndicatorSource> IndicatorSource for CachedSource<S> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn fetch(
        &self,
        instrument_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<InstrumentBar>, FetchError> {
        let key = Self::bar_key(instrument_id, start, end);

        if let Some(bars) = self.get_live(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(instrument = instrument_id, "Bar cache hit");
            return Ok(bars.as_ref().clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let bars = Arc::new(self.inner.fetch(instrument_id, start, end).await?);
        self.insert(key.clone(), Arc::clone(&bars));

        // Serve whatever won the insert race
        let served = self.get_live(&key).unwrap_or(bars);
        Ok(served.as_ref().clone())
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub active_entries: usize,
    pub hits: u64,
    pub misses: u64,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingSource {
        calls: AtomicU32,
        fail: bool,
    }

    impl CountingSource {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl IndicatorSource for CountingSource {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn fetch(
            &self,
            instrument_id: &str,
            _start: NaiveDate,
            end: NaiveDate,
        ) -> Result<Vec<InstrumentBar>, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(FetchError::Transient(instrument_id.to_string()));
            }
            Ok(vec![InstrumentBar {
                date: end,
                open: 10.0,
                high: 11.0,
                low: 9.5,
                close: 10.5,
                volume: 1000.0 + n as f64,
            }])
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn config(ttl_secs: u64, max_entries: usize) -> CacheConfig {
        CacheConfig {
            enabled: true,
            ttl_secs,
            max_entries,
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_inner() {
        let cache = CachedSource::new(CountingSource::new(false), &config(3600, 10));

        let first = cache.fetch("005930", day(1), day(10)).await.unwrap();
        let second = cache.fetch("005930", day(1), day(10)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(cache.inner.calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_cache_key_includes_window() {
        let cache = CachedSource::new(CountingSource::new(false), &config(3600, 10));

        cache.fetch("005930", day(1), day(10)).await.unwrap();
        cache.fetch("005930", day(2), day(10)).await.unwrap();
        cache.fetch("000660", day(1), day(10)).await.unwrap();

        assert_eq!(cache.inner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.stats().active_entries, 3);
    }

    #[tokio::test]
    async fn test_expired_entry_refetches() {
        let cache = CachedSource::new(CountingSource::new(false), &config(0, 10));

        cache.fetch("005930", day(1), day(10)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let refetched = cache.fetch("005930", day(1), day(10)).await.unwrap();

        assert_eq!(cache.inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(refetched[0].volume, 1001.0);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = CachedSource::new(CountingSource::new(true), &config(3600, 10));

        assert!(cache.fetch("005930", day(1), day(10)).await.is_err());
        assert!(cache.fetch("005930", day(1), day(10)).await.is_err());

        assert_eq!(cache.inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().total_entries, 0);
    }

    #[tokio::test]
    async fn test_max_entries_evicts() {
        let cache = CachedSource::new(CountingSource::new(false), &config(3600, 2));

        cache.fetch("a", day(1), day(10)).await.unwrap();
        cache.fetch("b", day(1), day(10)).await.unwrap();
        cache.fetch("c", day(1), day(10)).await.unwrap();

        assert_eq!(cache.stats().total_entries, 2);
    }

    #[tokio::test]
    async fn test_clear_expired_keeps_live_entries() {
        let expiring = CachedSource::new(CountingSource::new(false), &config(0, 10));
        expiring.fetch("a", day(1), day(10)).await.unwrap();
        expiring.fetch("b", day(1), day(10)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(expiring.clear_expired(), 2);
        assert_eq!(expiring.stats().total_entries, 0);

        let live = CachedSource::new(CountingSource::new(false), &config(3600, 10));
        live.fetch("a", day(1), day(10)).await.unwrap();
        assert_eq!(live.clear_expired(), 0);
        assert_eq!(live.stats().active_entries, 1);
    }

    #[tokio::test]
    async fn test_clear_forces_refetch() {
        let cache = CachedSource::new(CountingSource::new(false), &config(3600, 10));
        cache.fetch("005930", day(1), day(10)).await.unwrap();
        cache.fetch("000660", day(1), day(10)).await.unwrap();

        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.stats().total_entries, 0);

        cache.fetch("005930", day(1), day(10)).await.unwrap();
        assert_eq!(cache.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_live_entry_not_overwritten() {
        let cache = CachedSource::new(CountingSource::new(false), &config(3600, 10));
        let key = "x:2024-01-01:2024-01-10".to_string();
        let first = Arc::new(Vec::new());
        let second = Arc::new(vec![InstrumentBar {
            date: day(10),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
        }]);

        cache.insert(key.clone(), first);
        cache.insert(key.clone(), second);

        assert!(cache.get_live(&key).unwrap().is_empty());
    }
}
