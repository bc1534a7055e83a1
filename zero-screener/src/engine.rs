//! Screening engine.
//!
//! Drives one run: for every instrument in the universe it fetches a bar
//! window, computes indicators, applies the configured rule (tiered surge
//! grading or the MA20 threshold), and records qualifying results in the
//! history store. The per-instrument pipeline is the orchestrator's
//! unit of work. Only a failed universe listing aborts a run; every other
//! failure is counted in the report.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::classifier::{MaThresholdFilter, SignalClassifier, SignalGrade, Tier};
use crate::config::{ScreenerConfig, ScreeningStrategy};
use crate::data::{IndicatorSource, InstrumentRef, UniverseProvider, WatchList};
use crate::error::{FetchError, ScreenerError};
use crate::history::{HistoryStore, HistoryUpdateInfo, RunContext};
use crate::indicators::{IndicatorCalculator, IndicatorSet};
use crate::notification::Notifier;
use crate::orchestrator::{TaskError, TaskOrchestrator};

// ============================================================================
// Results
// ============================================================================

/// Whether the instrument was already on the watch list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreeningMode {
    /// Newly surfaced by the screen
    Initial,
    /// Already watched; the signal is a follow-up
    Monitoring,
}

/// One qualifying instrument. Surge results always carry tier A, B or C;
/// MA-threshold matches carry tier NONE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningResult {
    pub instrument_id: String,
    pub name: String,
    pub market: String,
    pub tier: Tier,
    pub score: u32,
    pub price: f64,
    pub today_return_pct: f64,
    /// `(close - MA20) / MA20` in percent
    pub ma20_gap_pct: f64,
    pub volume: f64,
    pub reasons: Vec<String>,
    pub mode: ScreeningMode,
    /// `None` when the history write failed
    pub history: Option<HistoryUpdateInfo>,
}

/// Instruments that produced no result without failing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipSummary {
    pub insufficient_data: usize,
    pub no_signal: usize,
}

/// Per-kind failure counts for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub fetch_not_found: usize,
    pub fetch_timeout: usize,
    pub fetch_transient: usize,
    pub task_timeout: usize,
    pub cancelled: usize,
    pub panicked: usize,
    pub store_failures: usize,
}

impl ErrorSummary {
    /// Instruments that failed outright. Store failures still produced a
    /// result and are not included.
    pub fn failed_instruments(&self) -> usize {
        self.fetch_not_found
            + self.fetch_timeout
            + self.fetch_transient
            + self.task_timeout
            + self.cancelled
            + self.panicked
    }

    fn record(&mut self, error: &TaskError<FetchError>) {
        match error {
            TaskError::Failed(FetchError::NotFound(_)) => self.fetch_not_found += 1,
            TaskError::Failed(FetchError::Timeout(_)) => self.fetch_timeout += 1,
            TaskError::Failed(FetchError::Transient(_)) => self.fetch_transient += 1,
            TaskError::Timeout => self.task_timeout += 1,
            TaskError::Cancelled => self.cancelled += 1,
            TaskError::Panicked => self.panicked += 1,
        }
    }
}

/// Tier-partitioned outcome of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningReport {
    pub run_id: String,
    pub run_date: NaiveDate,
    pub strategy: ScreeningStrategy,
    pub a: Vec<ScreeningResult>,
    pub b: Vec<ScreeningResult>,
    pub c: Vec<ScreeningResult>,
    /// MA-threshold matches, strongest gap first
    #[serde(default)]
    pub matched: Vec<ScreeningResult>,
    pub total_instruments: usize,
    pub skipped: SkipSummary,
    pub errors: ErrorSummary,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub deadline_exceeded: bool,
}

impl ScreeningReport {
    pub fn signal_count(&self) -> usize {
        self.a.len() + self.b.len() + self.c.len() + self.matched.len()
    }

    /// All results, tier A first and untiered matches last.
    pub fn results(&self) -> impl Iterator<Item = &ScreeningResult> {
        self.a
            .iter()
            .chain(self.b.iter())
            .chain(self.c.iter())
            .chain(self.matched.iter())
    }

    /// Results of one tier; `Tier::None` yields the MA-threshold matches.
    pub fn tier(&self, tier: Tier) -> &[ScreeningResult] {
        match tier {
            Tier::A => &self.a,
            Tier::B => &self.b,
            Tier::C => &self.c,
            Tier::None => &self.matched,
        }
    }
}

// ============================================================================
// Per-instrument pipeline
// ============================================================================

/// Non-failing outcome of screening one instrument.
#[derive(Debug)]
enum InstrumentOutcome {
    Qualified(ScreeningResult),
    /// Classified, but the history write failed
    Unrecorded(ScreeningResult),
    InsufficientData,
    NoSignal,
}

/// Per-instrument qualification rule.
#[derive(Debug, Clone)]
enum Rule {
    Surge(SignalClassifier),
    MaThreshold(MaThresholdFilter),
}

impl Rule {
    fn from_config(config: &ScreenerConfig) -> Self {
        match config.strategy.kind {
            ScreeningStrategy::Surge => {
                Rule::Surge(SignalClassifier::new(config.classification.clone()))
            }
            ScreeningStrategy::MaThreshold => {
                Rule::MaThreshold(MaThresholdFilter::from_config(&config.strategy))
            }
        }
    }

    fn strategy(&self) -> ScreeningStrategy {
        match self {
            Rule::Surge(_) => ScreeningStrategy::Surge,
            Rule::MaThreshold(_) => ScreeningStrategy::MaThreshold,
        }
    }

    /// `None` when the instrument does not qualify.
    fn apply(&self, indicators: &IndicatorSet) -> Option<SignalGrade> {
        match self {
            Rule::Surge(classifier) => {
                let grade = classifier.classify(indicators);
                grade.tier.is_signal().then_some(grade)
            }
            Rule::MaThreshold(filter) => filter.evaluate(indicators),
        }
    }
}

/// Everything one unit of work needs, shared across tasks.
#[derive(Clone)]
struct Pipeline {
    source: Arc<dyn IndicatorSource>,
    store: Arc<dyn HistoryStore>,
    watchlist: Arc<dyn WatchList>,
    calculator: IndicatorCalculator,
    rule: Rule,
    lookback: ChronoDuration,
}

impl Pipeline {
    async fn screen(
        &self,
        instrument: InstrumentRef,
        run: &RunContext,
    ) -> Result<InstrumentOutcome, FetchError> {
        let start = run.run_date - self.lookback;
        let bars = self.source.fetch(&instrument.id, start, run.run_date).await?;

        let indicators = match self.calculator.compute(&bars) {
            Ok(indicators) => indicators,
            Err(e) => {
                debug!(instrument = %instrument.id, available = e.available, required = e.required, "Skipping, insufficient data");
                return Ok(InstrumentOutcome::InsufficientData);
            }
        };

        let Some(grade) = self.rule.apply(&indicators) else {
            return Ok(InstrumentOutcome::NoSignal);
        };

        let mode = if self.watchlist.contains(&instrument.id) {
            ScreeningMode::Monitoring
        } else {
            ScreeningMode::Initial
        };

        let mut result = ScreeningResult {
            instrument_id: instrument.id,
            name: instrument.name,
            market: instrument.market,
            tier: grade.tier,
            score: grade.score,
            price: indicators.close,
            today_return_pct: indicators.today_return_pct,
            ma20_gap_pct: indicators.ma20_gap_pct().unwrap_or(0.0),
            volume: indicators.volume_today,
            reasons: grade.reasons,
            mode,
            history: None,
        };

        match self.store.upsert(&result, run).await {
            Ok(info) => {
                result.history = Some(info);
                Ok(InstrumentOutcome::Qualified(result))
            }
            Err(e) => {
                warn!(instrument = %result.instrument_id, error = %e, "Failed to record history");
                Ok(InstrumentOutcome::Unrecorded(result))
            }
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Runs screens over a universe of instruments.
pub struct ScreeningEngine {
    pipeline: Pipeline,
    orchestrator: TaskOrchestrator,
    batch_size: usize,
    streak_threshold: u32,
    notifier: Option<Arc<dyn Notifier>>,
}

impl ScreeningEngine {
    /// Engine with an empty watch list and no notifier.
    pub fn new(
        config: &ScreenerConfig,
        source: Arc<dyn IndicatorSource>,
        store: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            pipeline: Pipeline {
                source,
                store,
                watchlist: Arc::new(std::collections::HashSet::<String>::new()),
                calculator: IndicatorCalculator::new(&config.analysis),
                rule: Rule::from_config(config),
                lookback: ChronoDuration::days(i64::from(config.analysis.lookback_days)),
            },
            orchestrator: TaskOrchestrator::from_config(&config.orchestrator),
            batch_size: config.orchestrator.batch_size,
            streak_threshold: config.statistics.streak_threshold,
            notifier: None,
        }
    }

    pub fn with_watchlist(mut self, watchlist: Arc<dyn WatchList>) -> Self {
        self.pipeline.watchlist = watchlist;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Replace the orchestrator, e.g. to attach a progress callback.
    pub fn with_orchestrator(mut self, orchestrator: TaskOrchestrator) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    /// Cancelling this token stops the current run and every later one.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.orchestrator.cancellation_token()
    }

    pub fn store(&self) -> Arc<dyn HistoryStore> {
        self.pipeline.store.clone()
    }

    /// List the market's instruments, then screen them.
    pub async fn run_market(
        &self,
        provider: &dyn UniverseProvider,
        market: &str,
        run: &RunContext,
    ) -> Result<ScreeningReport, ScreenerError> {
        let universe = provider
            .list_instruments(market)
            .await
            .map_err(|source| ScreenerError::Universe {
                market: market.to_string(),
                source,
            })?;

        info!(market = %market, instruments = universe.len(), "Universe loaded");
        Ok(self.run(universe, run).await)
    }

    /// Screen the given universe.
    pub async fn run(&self, universe: Vec<InstrumentRef>, run: &RunContext) -> ScreeningReport {
        let span = info_span!("screening_run", run_id = %run.run_id, run_date = %run.run_date);
        self.run_inner(universe, run).instrument(span).await
    }

    async fn run_inner(&self, universe: Vec<InstrumentRef>, run: &RunContext) -> ScreeningReport {
        let started_at = Utc::now();
        let total_instruments = universe.len();
        info!(instruments = total_instruments, "Screening run started");

        let pipeline = Arc::new(self.pipeline.clone());
        let task_run = run.clone();
        let processed = self
            .orchestrator
            .process_batches(universe, self.batch_size, move |instrument| {
                let pipeline = pipeline.clone();
                let run = task_run.clone();
                async move { pipeline.screen(instrument, &run).await }
            })
            .await;

        let mut report = ScreeningReport {
            run_id: run.run_id.clone(),
            run_date: run.run_date,
            strategy: self.pipeline.rule.strategy(),
            a: Vec::new(),
            b: Vec::new(),
            c: Vec::new(),
            matched: Vec::new(),
            total_instruments,
            skipped: SkipSummary::default(),
            errors: ErrorSummary::default(),
            started_at,
            completed_at: started_at,
            duration_secs: 0.0,
            deadline_exceeded: processed.deadline_exceeded,
        };

        for outcome in processed.successes {
            let result = match outcome {
                InstrumentOutcome::Qualified(result) => result,
                InstrumentOutcome::Unrecorded(result) => {
                    report.errors.store_failures += 1;
                    result
                }
                InstrumentOutcome::InsufficientData => {
                    report.skipped.insufficient_data += 1;
                    continue;
                }
                InstrumentOutcome::NoSignal => {
                    report.skipped.no_signal += 1;
                    continue;
                }
            };
            match result.tier {
                Tier::A => report.a.push(result),
                Tier::B => report.b.push(result),
                Tier::C => report.c.push(result),
                Tier::None => report.matched.push(result),
            }
        }

        for failure in &processed.errors {
            if let TaskError::Failed(e) = &failure.error {
                debug!(instrument = %failure.item.id, error = %e, "Fetch failed");
            }
            report.errors.record(&failure.error);
        }

        for tier in [&mut report.a, &mut report.b, &mut report.c] {
            tier.sort_by(|x, y| {
                y.score
                    .cmp(&x.score)
                    .then_with(|| x.instrument_id.cmp(&y.instrument_id))
            });
        }
        // Untiered matches all score 0; rank by how far above MA20 they closed
        report.matched.sort_by(|x, y| {
            y.ma20_gap_pct
                .total_cmp(&x.ma20_gap_pct)
                .then_with(|| x.instrument_id.cmp(&y.instrument_id))
        });

        report.completed_at = Utc::now();
        report.duration_secs = processed.elapsed.as_secs_f64();

        info!(
            a = report.a.len(),
            b = report.b.len(),
            c = report.c.len(),
            matched = report.matched.len(),
            insufficient_data = report.skipped.insufficient_data,
            no_signal = report.skipped.no_signal,
            failed = report.errors.failed_instruments(),
            store_failures = report.errors.store_failures,
            deadline_exceeded = report.deadline_exceeded,
            duration_secs = report.duration_secs,
            "Screening run completed"
        );

        self.notify(&report).await;
        report
    }

    async fn notify(&self, report: &ScreeningReport) {
        let Some(notifier) = &self.notifier else {
            return;
        };

        let stats = match self
            .pipeline
            .store
            .get_statistics(report.run_date, self.streak_threshold)
            .await
        {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "Failed to load history statistics, skipping notification");
                return;
            }
        };

        if let Err(e) = notifier.deliver(report, &stats).await {
            warn!(notifier = notifier.name(), error = %e, "Notification delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, tier: Tier, score: u32) -> ScreeningResult {
        ScreeningResult {
            instrument_id: id.to_string(),
            name: id.to_string(),
            market: "KOSPI".to_string(),
            tier,
            score,
            price: 1.0,
            today_return_pct: 1.0,
            ma20_gap_pct: 1.0,
            volume: 1.0,
            reasons: Vec::new(),
            mode: ScreeningMode::Initial,
            history: None,
        }
    }

    #[test]
    fn test_error_summary_record() {
        let mut summary = ErrorSummary::default();
        summary.record(&TaskError::Failed(FetchError::NotFound("x".into())));
        summary.record(&TaskError::Failed(FetchError::Transient("x".into())));
        summary.record(&TaskError::Timeout);
        summary.record(&TaskError::Cancelled);
        summary.record(&TaskError::Cancelled);
        summary.store_failures = 4;

        assert_eq!(summary.fetch_not_found, 1);
        assert_eq!(summary.fetch_transient, 1);
        assert_eq!(summary.task_timeout, 1);
        assert_eq!(summary.cancelled, 2);
        assert_eq!(summary.failed_instruments(), 5);
    }

    #[test]
    fn test_mode_serialization() {
        assert_eq!(
            serde_json::to_string(&ScreeningMode::Monitoring).unwrap(),
            "\"monitoring\""
        );
    }

    #[test]
    fn test_report_accessors() {
        let now = Utc::now();
        let report = ScreeningReport {
            run_id: "r".into(),
            run_date: now.date_naive(),
            strategy: ScreeningStrategy::Surge,
            a: vec![sample("X", Tier::A, 9)],
            b: vec![],
            c: vec![sample("Y", Tier::C, 2), sample("Z", Tier::C, 2)],
            matched: vec![],
            total_instruments: 5,
            skipped: SkipSummary::default(),
            errors: ErrorSummary::default(),
            started_at: now,
            completed_at: now,
            duration_secs: 0.0,
            deadline_exceeded: false,
        };

        assert_eq!(report.signal_count(), 3);
        assert_eq!(report.tier(Tier::C).len(), 2);
        assert!(report.tier(Tier::None).is_empty());
        let ids: Vec<_> = report.results().map(|r| r.instrument_id.as_str()).collect();
        assert_eq!(ids, vec!["X", "Y", "Z"]);
    }
}
