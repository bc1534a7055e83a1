//! Retry decorator for indicator sources.
//!
//! All retry/backoff for bar fetching lives here so that the engine and the
//! orchestrator never loop on failures themselves.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::time::Duration;
use tracing::{debug, warn};

use super::{IndicatorSource, InstrumentBar};
use crate::config::RetryConfig;
use crate::error::FetchError;

/// Exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Retrying decorator around any [`IndicatorSource`].
///
/// Only retryable errors (`Timeout`, `Transient`) are retried; `NotFound`
/// is returned immediately.
pub struct RetryingSource<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: IndicatorSource> RetryingSource<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<S: IndicatorSource> IndicatorSource for RetryingSource<S> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn fetch(
        &self,
        instrument_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<InstrumentBar>, FetchError> {
        let mut attempt = 1;
        loop {
            match self.inner.fetch(instrument_id, start, end).await {
                Ok(bars) => {
                    if attempt > 1 {
                        debug!(instrument = instrument_id, attempt, "Fetch succeeded after retry");
                    }
                    return Ok(bars);
                }
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let wait = self.policy.backoff_for(attempt);
                    debug!(
                        instrument = instrument_id,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "Retrying fetch"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!(instrument = instrument_id, attempts = attempt, error = %e, "Fetch retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}
