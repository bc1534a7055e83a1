//! Market data module.
//!
//! Defines the bar and instrument types plus the source abstractions the
//! engine reads from. Sources compose as decorators:
//!
//! ```text
//! CachedSource( RetryingSource( SnapshotSource | any IndicatorSource ) )
//! ```
//!
//! - **provider**: `IndicatorSource` and `UniverseProvider` traits
//! - **cache**: TTL cache keyed by (instrument, start, end)
//! - **retry**: centralised retry/backoff policy
//! - **snapshot**: file-backed source used by the binary
//! - **watchlist**: membership check deciding the result mode

mod cache;
mod provider;
mod retry;
mod snapshot;
mod watchlist;

pub use cache::{CacheStats, CachedSource};
pub use provider::{IndicatorSource, UniverseProvider};
pub use retry::{RetryPolicy, RetryingSource};
pub use snapshot::{SnapshotSource, ALL_MARKETS};
pub use watchlist::{JsonWatchList, WatchList};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ============================================================================
// Core Types
// ============================================================================

/// A single daily bar (OHLCV). Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentBar {
    /// Trading date
    pub date: NaiveDate,
    /// Open price
    pub open: f64,
    /// High price
    pub high: f64,
    /// Low price
    pub low: f64,
    /// Close price
    pub close: f64,
    /// Volume
    pub volume: f64,
}

impl InstrumentBar {
    /// High-low range
    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}

/// A tradable instrument in the screening universe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentRef {
    /// Ticker/code (e.g., "005930")
    pub id: String,
    /// Display name
    pub name: String,
    /// Market the instrument trades on (e.g., "KOSPI")
    pub market: String,
}

impl InstrumentRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>, market: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            market: market.into(),
        }
    }
}
