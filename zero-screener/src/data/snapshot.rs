//! File-backed snapshot source.
//!
//! Reads a market snapshot exported by an external collector:
//!
//! ```text
//! <dir>/universe.json        [{"id": "005930", "name": "...", "market": "KOSPI"}, ...]
//! <dir>/bars/<id>.json       [{"date": "2024-01-10", "open": .., "high": .., ...}, ...]
//! ```

use async_trait::async_trait;
use chrono::NaiveDate;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{IndicatorSource, InstrumentBar, InstrumentRef, UniverseProvider};
use crate::error::FetchError;

/// Market name that selects every instrument in the universe.
pub const ALL_MARKETS: &str = "ALL";

/// Snapshot directory acting as both universe provider and bar source.
#[derive(Debug, Clone)]
pub struct SnapshotSource {
    dir: PathBuf,
}

impl SnapshotSource {
    /// Open a snapshot directory.
    pub fn open(dir: impl Into<PathBuf>) -> zero_common::Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(zero_common::Error::NotFound(format!(
                "snapshot directory {}",
                dir.display()
            )));
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn bars_path(&self, instrument_id: &str) -> PathBuf {
        self.dir.join("bars").join(format!("{}.json", instrument_id))
    }

    async fn read(path: &Path, what: &str) -> Result<String, FetchError> {
        tokio::fs::read_to_string(path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => FetchError::NotFound(format!("{} ({})", what, path.display())),
            _ => FetchError::Transient(format!("{}: {}", what, e)),
        })
    }
}

#[async_trait]
impl UniverseProvider for SnapshotSource {
    async fn list_instruments(&self, market: &str) -> Result<Vec<InstrumentRef>, FetchError> {
        let content = Self::read(&self.dir.join("universe.json"), "universe").await?;
        let universe: Vec<InstrumentRef> = serde_json::from_str(&content)
            .map_err(|e| FetchError::NotFound(format!("unreadable universe: {}", e)))?;

        let selected: Vec<InstrumentRef> = universe
            .into_iter()
            .filter(|i| market.eq_ignore_ascii_case(ALL_MARKETS) || i.market.eq_ignore_ascii_case(market))
            .collect();

        debug!(market, count = selected.len(), "Loaded snapshot universe");
        Ok(selected)
    }
}

#[async_trait]
impl IndicatorSource for SnapshotSource {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    async fn fetch(
        &self,
        instrument_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<InstrumentBar>, FetchError> {
        let content = Self::read(&self.bars_path(instrument_id), instrument_id).await?;
        let bars: Vec<InstrumentBar> = serde_json::from_str(&content).map_err(|e| {
            FetchError::NotFound(format!("unreadable bars for {}: {}", instrument_id, e))
        })?;

        Ok(bars
            .into_iter()
            .filter(|b| b.date >= start && b.date <= end)
            .collect())
    }
}
