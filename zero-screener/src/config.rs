//! Screener configuration module.
//!
//! Defines configuration structures for the surge screener. The whole tree is
//! read from the `screener` section of the shared Zero config (or the modular
//! `screener.json`), with every field defaulted.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use zero_common::config::Config;
use zero_common::{Validate, ValidationError, ValidationResult};

use crate::classifier::ClassificationCriteria;

// ============================================================================
// Main Screener Configuration
// ============================================================================

/// Configuration for the surge screener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenerConfig {
    /// Market to screen ("ALL" for the whole universe)
    #[serde(default = "default_market")]
    pub market: String,

    /// Snapshot directory read by the binary
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,

    /// Watch list deciding initial vs monitoring mode
    #[serde(default = "default_watchlist_path")]
    pub watchlist_path: PathBuf,

    /// Where the report JSON is written after each run (unset: log only)
    #[serde(default)]
    pub report_path: Option<PathBuf>,

    /// Per-instrument rule: tiered surge grading or the MA20 threshold
    #[serde(default)]
    pub strategy: StrategyConfig,

    /// Concurrency, timeouts and batching
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Indicator windows
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Tier thresholds and gating multipliers
    #[serde(default)]
    pub classification: ClassificationCriteria,

    /// Bar cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Fetch retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// History persistence
    #[serde(default)]
    pub storage: StorageConfig,

    /// History statistics
    #[serde(default)]
    pub statistics: StatisticsConfig,
}

impl Default for ScreenerConfig {
    fn default() -> Self {
        Self {
            market: default_market(),
            snapshot_dir: default_snapshot_dir(),
            watchlist_path: default_watchlist_path(),
            report_path: None,
            strategy: StrategyConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            analysis: AnalysisConfig::default(),
            classification: ClassificationCriteria::default(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            storage: StorageConfig::default(),
            statistics: StatisticsConfig::default(),
        }
    }
}

impl ScreenerConfig {
    /// Extract the screener section from the shared config and apply
    /// screener-specific environment overrides.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut screener: Self = config.screener_section()?;
        screener.apply_env_overrides();
        Ok(screener)
    }

    /// Environment overrides:
    /// - `ZERO_SCREENER_WORKERS` → orchestrator.max_workers
    /// - `ZERO_SCREENER_DB` → storage.db_path
    pub fn apply_env_overrides(&mut self) {
        if let Ok(workers) = std::env::var("ZERO_SCREENER_WORKERS") {
            if let Ok(w) = workers.parse() {
                self.orchestrator.max_workers = w;
            }
        }
        if let Ok(db) = std::env::var("ZERO_SCREENER_DB") {
            self.storage.db_path = PathBuf::from(db);
        }
    }
}

fn zero_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".codecoder")
}

fn default_market() -> String {
    "ALL".to_string()
}

fn default_snapshot_dir() -> PathBuf {
    zero_home().join("screener").join("snapshot")
}

fn default_watchlist_path() -> PathBuf {
    zero_home().join("screener").join("watchlist.json")
}

// ============================================================================
// Strategy Configuration
// ============================================================================

/// Which per-instrument rule a run applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreeningStrategy {
    /// Weighted score with A/B/C tier gates
    #[default]
    Surge,
    /// Close at least `ma_threshold_pct` above MA20
    MaThreshold,
}

/// Strategy selection and the MA-threshold parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default)]
    pub kind: ScreeningStrategy,

    /// Minimum `(close - MA20) / MA20` in percent
    #[serde(default = "default_ma_threshold_pct")]
    pub ma_threshold_pct: f64,

    /// Today's volume must reach this multiple of the 20-bar average;
    /// 1.0 or below disables the volume filter
    #[serde(default = "default_volume_multiplier")]
    pub volume_multiplier: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kind: ScreeningStrategy::default(),
            ma_threshold_pct: default_ma_threshold_pct(),
            volume_multiplier: default_volume_multiplier(),
        }
    }
}

fn default_ma_threshold_pct() -> f64 {
    5.0
}

fn default_volume_multiplier() -> f64 {
    1.0
}

// ============================================================================
// Orchestrator Configuration
// ============================================================================

/// Bounded-concurrency executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum concurrently running items
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Per-item timeout in seconds
    #[serde(default = "default_item_timeout_secs")]
    pub item_timeout_secs: u64,

    /// Overall deadline for a run in seconds
    #[serde(default = "default_total_timeout_secs")]
    pub total_timeout_secs: u64,

    /// Items per sequential batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Progress callback interval in milliseconds
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            item_timeout_secs: default_item_timeout_secs(),
            total_timeout_secs: default_total_timeout_secs(),
            batch_size: default_batch_size(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

fn default_max_workers() -> usize {
    12
}

fn default_item_timeout_secs() -> u64 {
    30
}

fn default_total_timeout_secs() -> u64 {
    300
}

fn default_batch_size() -> usize {
    500
}

fn default_progress_interval_ms() -> u64 {
    2_000
}

// ============================================================================
// Analysis Configuration
// ============================================================================

/// Indicator windows and fetch range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Calendar days of history fetched per instrument
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,

    /// Short moving-average period
    #[serde(default = "default_ma_period_short")]
    pub ma_period_short: usize,

    /// Long moving-average period (also the high/low window)
    #[serde(default = "default_ma_period_long")]
    pub ma_period_long: usize,

    /// Long volume-average window
    #[serde(default = "default_window")]
    pub volume_window: usize,

    /// Long volatility window
    #[serde(default = "default_window")]
    pub volatility_window: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            ma_period_short: default_ma_period_short(),
            ma_period_long: default_ma_period_long(),
            volume_window: default_window(),
            volatility_window: default_window(),
        }
    }
}

fn default_lookback_days() -> u32 {
    120
}

fn default_ma_period_short() -> usize {
    5
}

fn default_ma_period_long() -> usize {
    20
}

fn default_window() -> usize {
    20
}

// ============================================================================
// Cache / Retry / Storage / Statistics
// ============================================================================

/// Bar cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Entry lifetime in seconds
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    /// Maximum cached windows
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl_secs(),
            max_entries: default_cache_max_entries(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_cache_max_entries() -> usize {
    1000
}

/// Retry settings for bar fetches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

/// History store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

/// History persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,

    /// Path to the SQLite database
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// How long a writer waits on a locked database, in milliseconds
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            db_path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_backend() -> StorageBackend {
    StorageBackend::Sqlite
}

fn default_db_path() -> PathBuf {
    zero_home().join("screener_history.db")
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

/// History statistics settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsConfig {
    /// Streak length counted as "hot"
    #[serde(default = "default_streak_threshold")]
    pub streak_threshold: u32,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            streak_threshold: default_streak_threshold(),
        }
    }
}

fn default_streak_threshold() -> u32 {
    5
}

// ============================================================================
// Validation
// ============================================================================

/// Upper bound for orchestrator timeouts (one week).
const MAX_TIMEOUT_SECS: u64 = 7 * 86_400;

fn invalid(field: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.into(),
        reason: reason.into(),
    }
}

impl Validate for OrchestratorConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();
        if !(1..=50).contains(&self.max_workers) {
            errors.push(invalid("orchestrator.max_workers", "must be between 1 and 50"));
        }
        if !(1..=MAX_TIMEOUT_SECS).contains(&self.item_timeout_secs) {
            errors.push(invalid(
                "orchestrator.item_timeout_secs",
                format!("must be between 1 and {}", MAX_TIMEOUT_SECS),
            ));
        }
        if self.total_timeout_secs > MAX_TIMEOUT_SECS {
            errors.push(invalid(
                "orchestrator.total_timeout_secs",
                format!("must not exceed {}", MAX_TIMEOUT_SECS),
            ));
        }
        if self.total_timeout_secs < self.item_timeout_secs {
            errors.push(ValidationError::Conflict {
                reason: "orchestrator.total_timeout_secs is shorter than item_timeout_secs".into(),
            });
        }
        if self.batch_size == 0 {
            errors.push(invalid("orchestrator.batch_size", "must be greater than 0"));
        }
        if self.progress_interval_ms == 0 {
            errors.push(invalid("orchestrator.progress_interval_ms", "must be greater than 0"));
        }
        ValidationError::collect(errors)
    }
}

impl Validate for StrategyConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();
        if !self.ma_threshold_pct.is_finite() {
            errors.push(invalid("strategy.ma_threshold_pct", "must be a finite number"));
        }
        if !(self.volume_multiplier.is_finite() && self.volume_multiplier > 0.0) {
            errors.push(invalid("strategy.volume_multiplier", "must be positive"));
        }
        ValidationError::collect(errors)
    }
}

impl Validate for AnalysisConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();
        if self.ma_period_short < 2 {
            errors.push(invalid("analysis.ma_period_short", "must be at least 2"));
        }
        if self.ma_period_long <= self.ma_period_short {
            errors.push(ValidationError::Conflict {
                reason: "analysis.ma_period_long must exceed ma_period_short".into(),
            });
        }
        if self.volume_window < 2 || self.volatility_window < 2 {
            errors.push(invalid(
                "analysis.volume_window/volatility_window",
                "must be at least 2",
            ));
        }
        // Calendar days must cover the trading days the windows need
        let needed = self
            .ma_period_long
            .max(self.volume_window)
            .max(self.volatility_window)
            .max(self.ma_period_short * 2);
        if (self.lookback_days as usize) < needed {
            errors.push(invalid(
                "analysis.lookback_days",
                format!("must cover at least {} days", needed),
            ));
        }
        ValidationError::collect(errors)
    }
}

impl Validate for ScreenerConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if self.market.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "market".into(),
            });
        }
        for result in [
            self.strategy.validate(),
            self.orchestrator.validate(),
            self.analysis.validate(),
            self.classification.validate(),
        ] {
            if let Err(e) = result {
                errors.push(e);
            }
        }
        if self.cache.enabled && self.cache.max_entries == 0 {
            errors.push(invalid("cache.max_entries", "must be greater than 0"));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            errors.push(ValidationError::Conflict {
                reason: "retry.initial_backoff_ms exceeds max_backoff_ms".into(),
            });
        }
        if self.statistics.streak_threshold == 0 {
            errors.push(invalid("statistics.streak_threshold", "must be greater than 0"));
        }

        ValidationError::collect(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = ScreenerConfig::default();
        assert_eq!(config.orchestrator.max_workers, 12);
        assert_eq!(config.orchestrator.item_timeout_secs, 30);
        assert_eq!(config.orchestrator.total_timeout_secs, 300);
        assert_eq!(config.orchestrator.batch_size, 500);
        assert_eq!(config.analysis.lookback_days, 120);
        assert_eq!(config.cache.ttl_secs, 3600);
        assert_eq!(config.cache.max_entries, 1000);
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.statistics.streak_threshold, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: ScreenerConfig = serde_json::from_value(json!({
            "market": "KOSDAQ",
            "orchestrator": {"max_workers": 4},
            "storage": {"backend": "memory"}
        }))
        .unwrap();

        assert_eq!(config.market, "KOSDAQ");
        assert_eq!(config.orchestrator.max_workers, 4);
        assert_eq!(config.orchestrator.batch_size, 500);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.classification.a_score_threshold, 6);
    }

    #[test]
    fn test_from_shared_config() {
        let shared = Config {
            screener: json!({"analysis": {"lookback_days": 90}}),
            ..Default::default()
        };
        let config = ScreenerConfig::from_config(&shared).unwrap();
        assert_eq!(config.analysis.lookback_days, 90);
    }

    #[test]
    fn test_worker_bounds() {
        let mut config = ScreenerConfig::default();
        config.orchestrator.max_workers = 0;
        assert!(config.validate().is_err());
        config.orchestrator.max_workers = 51;
        assert!(config.validate().is_err());
        config.orchestrator.max_workers = 50;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeout_conflict() {
        let mut config = OrchestratorConfig::default();
        config.total_timeout_secs = 10;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::Conflict { .. })
        ));
    }

    #[test]
    fn test_strategy_section() {
        let config: ScreenerConfig = serde_json::from_value(json!({
            "strategy": {"kind": "ma_threshold", "ma_threshold_pct": 3.5}
        }))
        .unwrap();
        assert_eq!(config.strategy.kind, ScreeningStrategy::MaThreshold);
        assert_eq!(config.strategy.ma_threshold_pct, 3.5);
        assert_eq!(config.strategy.volume_multiplier, 1.0);
        assert!(config.validate().is_ok());

        assert_eq!(ScreenerConfig::default().strategy.kind, ScreeningStrategy::Surge);

        let mut config = ScreenerConfig::default();
        config.strategy.volume_multiplier = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeouts_are_capped() {
        let mut config = OrchestratorConfig::default();
        config.total_timeout_secs = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.item_timeout_secs = u64::MAX;
        config.total_timeout_secs = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.total_timeout_secs = MAX_TIMEOUT_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lookback_must_cover_windows() {
        let config = AnalysisConfig {
            lookback_days: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
