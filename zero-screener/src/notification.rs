//! Report hand-off.
//!
//! The engine passes every finished report to an optional [`Notifier`]
//! together with the history statistics for the run date. Formatting and
//! delivery are up to the implementation; failures are logged by the engine
//! and never fail the run.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

use crate::engine::ScreeningReport;
use crate::history::HistoryStatistics;

/// Consumer of finished screening reports.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, report: &ScreeningReport, stats: &HistoryStatistics) -> Result<()>;
}

/// Writes a one-line structured summary to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, report: &ScreeningReport, stats: &HistoryStatistics) -> Result<()> {
        info!(
            run_id = %report.run_id,
            run_date = %report.run_date,
            strategy = ?report.strategy,
            a = report.a.len(),
            b = report.b.len(),
            c = report.c.len(),
            matched = report.matched.len(),
            discovered_today = stats.discovered_today,
            new_this_week = stats.new_this_week,
            streak_at_least_n = stats.streak_at_least_n,
            total_instruments = stats.total_instruments,
            "Screening summary"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    report: &'a ScreeningReport,
    statistics: &'a HistoryStatistics,
}

/// Writes report and statistics as pretty JSON to a file, replacing any
/// previous content.
#[derive(Debug, Clone)]
pub struct JsonFileNotifier {
    path: PathBuf,
}

impl JsonFileNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Notifier for JsonFileNotifier {
    fn name(&self) -> &'static str {
        "json_file"
    }

    async fn deliver(&self, report: &ScreeningReport, stats: &HistoryStatistics) -> Result<()> {
        let body = serde_json::to_string_pretty(&Envelope {
            report,
            statistics: stats,
        })?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&self.path, body)
            .await
            .with_context(|| format!("Failed to write report to {}", self.path.display()))?;

        info!(path = %self.path.display(), "Report written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScreeningStrategy;
    use crate::engine::{ErrorSummary, SkipSummary};
    use chrono::Utc;
    use tempfile::tempdir;

    fn empty_report() -> ScreeningReport {
        let now = Utc::now();
        ScreeningReport {
            run_id: "run-1".into(),
            run_date: now.date_naive(),
            strategy: ScreeningStrategy::Surge,
            a: vec![],
            b: vec![],
            c: vec![],
            matched: vec![],
            total_instruments: 0,
            skipped: SkipSummary::default(),
            errors: ErrorSummary::default(),
            started_at: now,
            completed_at: now,
            duration_secs: 0.0,
            deadline_exceeded: false,
        }
    }

    #[tokio::test]
    async fn test_json_file_notifier_writes_envelope() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reports").join("latest.json");
        let notifier = JsonFileNotifier::new(&path);

        let stats = HistoryStatistics {
            total_instruments: 7,
            ..Default::default()
        };
        notifier.deliver(&empty_report(), &stats).await.unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["report"]["run_id"], "run-1");
        assert_eq!(written["statistics"]["total_instruments"], 7);
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        LogNotifier
            .deliver(&empty_report(), &HistoryStatistics::default())
            .await
            .unwrap();
    }
}
