//! Technical indicator calculation.
//!
//! Turns a window of daily bars into the fixed indicator set the classifier
//! scores. All rolling windows are trailing and end at the most recent bar.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use thiserror::Error;

use crate::config::AnalysisConfig;
use crate::data::InstrumentBar;

/// Guard against division by zero on flat or zero-priced bars.
const EPSILON: f64 = 1e-9;

/// The window is too short to compute every indicator. A valid skip.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Insufficient data: {available} bars, need {required}")]
pub struct InsufficientData {
    pub available: usize,
    pub required: usize,
}

/// Indicators for the most recent bar of a window.
///
/// `*5` fields use the short window and `*20` fields the long windows from
/// [`AnalysisConfig`]; the names reflect the default periods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub close: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub volume_today: f64,
    pub volume_prev: f64,
    /// Mean close over the short window
    pub ma5: f64,
    /// Mean close over the long window
    pub ma20: f64,
    /// Mean volume over the short window
    pub vol_avg5: f64,
    /// Mean volume over the volume window
    pub vol_avg20: f64,
    /// Highest high over the long window
    pub high20: f64,
    /// Lowest low over the long window
    pub low20: f64,
    /// Sample std of high-low over the short window
    pub volatility5: f64,
    /// Sample std of high-low over the volatility window
    pub volatility20: f64,
    pub today_return_pct: f64,
    /// Lowest low of the last short window
    pub min_low5: f64,
    /// Lowest low of the short window before that
    pub min_low_prev5: f64,
    /// close - open, negative on a bearish bar
    pub candle_body: f64,
    /// high - low, floored at a tiny positive value
    pub candle_range: f64,
}

impl IndicatorSet {
    /// Lows of the last window are above the lows of the window before.
    pub fn has_rising_lows(&self) -> bool {
        self.min_low5 > self.min_low_prev5
    }

    /// Percent distance of the close from MA20; `None` without a usable MA.
    pub fn ma20_gap_pct(&self) -> Option<f64> {
        (self.ma20 > 0.0).then(|| (self.close - self.ma20) / self.ma20 * 100.0)
    }
}

/// Pure indicator calculator.
#[derive(Debug, Clone)]
pub struct IndicatorCalculator {
    short: usize,
    long: usize,
    volume_window: usize,
    volatility_window: usize,
}

impl IndicatorCalculator {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            short: config.ma_period_short,
            long: config.ma_period_long,
            volume_window: config.volume_window,
            volatility_window: config.volatility_window,
        }
    }

    /// Minimum number of bars `compute` accepts.
    pub fn min_bars(&self) -> usize {
        self.long
            .max(self.volume_window)
            .max(self.volatility_window)
            .max(self.short * 2)
    }

    /// Compute indicators for the most recent bar.
    ///
    /// Bars are sorted by date first; the caller's order is not trusted.
    pub fn compute(&self, bars: &[InstrumentBar]) -> Result<IndicatorSet, InsufficientData> {
        let required = self.min_bars();
        if bars.len() < required {
            return Err(InsufficientData {
                available: bars.len(),
                required,
            });
        }

        let mut sorted: Vec<&InstrumentBar> = bars.iter().collect();
        sorted.sort_by_key(|b| b.date);

        let n = sorted.len();
        let last = sorted[n - 1];
        let prev = sorted[n - 2];

        let closes: Vec<f64> = sorted.iter().map(|b| b.close).collect();
        let volumes: Vec<f64> = sorted.iter().map(|b| b.volume).collect();
        let highs: Vec<f64> = sorted.iter().map(|b| b.high).collect();
        let lows: Vec<f64> = sorted.iter().map(|b| b.low).collect();
        let ranges: Vec<f64> = sorted.iter().map(|b| b.range()).collect();

        let min_low5 = min(tail(&lows, self.short));
        let min_low_prev5 = {
            let prior = &lows[..n - self.short];
            if prior.is_empty() {
                min_low5
            } else {
                min(tail(prior, self.short))
            }
        };

        Ok(IndicatorSet {
            close: last.close,
            open: last.open,
            high: last.high,
            low: last.low,
            volume_today: last.volume,
            volume_prev: prev.volume,
            ma5: tail(&closes, self.short).iter().mean(),
            ma20: tail(&closes, self.long).iter().mean(),
            vol_avg5: tail(&volumes, self.short).iter().mean(),
            vol_avg20: tail(&volumes, self.volume_window).iter().mean(),
            high20: max(tail(&highs, self.long)),
            low20: min(tail(&lows, self.long)),
            volatility5: tail(&ranges, self.short).iter().std_dev(),
            volatility20: tail(&ranges, self.volatility_window).iter().std_dev(),
            today_return_pct: (last.close - last.open) / last.open.max(EPSILON) * 100.0,
            min_low5,
            min_low_prev5,
            candle_body: last.close - last.open,
            candle_range: last.range().max(EPSILON),
        })
    }
}

impl Default for IndicatorCalculator {
    fn default() -> Self {
        Self::new(&AnalysisConfig::default())
    }
}

fn tail(values: &[f64], len: usize) -> &[f64] {
    &values[values.len().saturating_sub(len)..]
}

fn min(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

fn max(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}
