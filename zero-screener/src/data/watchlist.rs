//! Watch list membership.
//!
//! An instrument already on the watch list is screened in `monitoring` mode,
//! everything else in `initial` mode.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use zero_common::error::{Error, Result, ResultExt};

/// Read-only membership check.
pub trait WatchList: Send + Sync {
    fn contains(&self, instrument_id: &str) -> bool;
}

impl WatchList for HashSet<String> {
    fn contains(&self, instrument_id: &str) -> bool {
        HashSet::contains(self, instrument_id)
    }
}

/// Watch list backed by a `watchlist.json` object keyed by instrument id.
///
/// The values are opaque to the screener; only the keys are read.
#[derive(Debug, Clone, Default)]
pub struct JsonWatchList {
    ids: HashSet<String>,
}

impl JsonWatchList {
    /// Load the watch list. A missing file yields an empty list.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Watch list not found, starting empty");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read watch list {}", path.display()))?;
        let entries: HashMap<String, serde_json::Value> = serde_json::from_str(&content)
            .map_err(Error::from)
            .context(format!("Failed to parse watch list {}", path.display()))?;

        Ok(Self {
            ids: entries.into_keys().collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl WatchList for JsonWatchList {
    fn contains(&self, instrument_id: &str) -> bool {
        self.ids.contains(instrument_id)
    }
}
