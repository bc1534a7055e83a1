//! Signal classification.
//!
//! Scores an [`IndicatorSet`] against a fixed weight table, picks the highest
//! tier whose score threshold is met, then requires that tier's gate to hold.
//! A tier whose gate fails degrades to the next lower tier whose threshold
//! and gate both hold, else `NONE`.
//!
//! # Score table
//!
//! | Condition                              | Weight |
//! |----------------------------------------|--------|
//! | close >= MA20                          | 1 |
//! | today return >= 2 %                    | 1 |
//! | close >= 95 % of 20-period high        | 1 |
//! | close >= 20-period high                | 2 |
//! | volume >= 1.5x previous                | 1 |
//! | volume >= 3x previous                  | 2 |
//! | volume >= 2x 5-period average          | 1 |
//! | volume >= 5x 5-period average          | 2 |
//! | min low (last 5) > min low (prior 5)   | 1 |
//! | close > open                           | 1 |
//! | body >= 70 % of range                  | 2 |
//!
//! [`MaThresholdFilter`] is the untiered alternative: it keeps instruments
//! trading a fixed percentage above MA20, optionally on heavy volume.

use serde::{Deserialize, Serialize};
use std::fmt;
use zero_common::{Validate, ValidationError, ValidationResult};

use crate::config::StrategyConfig;
use crate::indicators::IndicatorSet;

// ============================================================================
// Tier / Grade
// ============================================================================

/// Alert tier, `A` strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    A,
    B,
    C,
    #[serde(rename = "NONE")]
    None,
}

impl Tier {
    /// Tiers that produce a result, strongest first.
    pub const RANKED: [Tier; 3] = [Tier::A, Tier::B, Tier::C];

    pub fn is_signal(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
            Self::C => write!(f, "C"),
            Self::None => write!(f, "NONE"),
        }
    }
}

/// Classification outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalGrade {
    pub tier: Tier,
    pub score: u32,
    /// Conditions of the assigned tier that held, in fixed priority order
    pub reasons: Vec<String>,
}

// ============================================================================
// Criteria
// ============================================================================

/// Tier thresholds and gating multipliers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationCriteria {
    #[serde(default = "default_a_score_threshold")]
    pub a_score_threshold: u32,
    #[serde(default = "default_b_score_threshold")]
    pub b_score_threshold: u32,
    #[serde(default = "default_c_score_threshold")]
    pub c_score_threshold: u32,

    // === A gate ===
    #[serde(default = "default_a_volume_multiplier_prev")]
    pub a_volume_multiplier_prev: f64,
    #[serde(default = "default_a_volume_multiplier_avg5")]
    pub a_volume_multiplier_avg5: f64,
    /// close / open required for a big candle
    #[serde(default = "default_a_price_breakout_ratio")]
    pub a_price_breakout_ratio: f64,
    /// body / range required for a big candle
    #[serde(default = "default_a_candle_body_ratio")]
    pub a_candle_body_ratio: f64,
    #[serde(default = "default_a_high20_proximity")]
    pub a_high20_proximity: f64,

    // === B gate ===
    #[serde(default = "default_b_high20_proximity")]
    pub b_high20_proximity: f64,
    #[serde(default = "default_b_volume_multiplier")]
    pub b_volume_multiplier: f64,

    // === C gate ===
    /// Minimum today return in percent
    #[serde(default = "default_c_return_threshold")]
    pub c_return_threshold: f64,
    #[serde(default = "default_c_volume_multiplier_prev")]
    pub c_volume_multiplier_prev: f64,
    #[serde(default = "default_c_volume_multiplier_avg5")]
    pub c_volume_multiplier_avg5: f64,
}

impl Default for ClassificationCriteria {
    fn default() -> Self {
        Self {
            a_score_threshold: default_a_score_threshold(),
            b_score_threshold: default_b_score_threshold(),
            c_score_threshold: default_c_score_threshold(),
            a_volume_multiplier_prev: default_a_volume_multiplier_prev(),
            a_volume_multiplier_avg5: default_a_volume_multiplier_avg5(),
            a_price_breakout_ratio: default_a_price_breakout_ratio(),
            a_candle_body_ratio: default_a_candle_body_ratio(),
            a_high20_proximity: default_a_high20_proximity(),
            b_high20_proximity: default_b_high20_proximity(),
            b_volume_multiplier: default_b_volume_multiplier(),
            c_return_threshold: default_c_return_threshold(),
            c_volume_multiplier_prev: default_c_volume_multiplier_prev(),
            c_volume_multiplier_avg5: default_c_volume_multiplier_avg5(),
        }
    }
}

fn default_a_score_threshold() -> u32 {
    6
}
fn default_b_score_threshold() -> u32 {
    4
}
fn default_c_score_threshold() -> u32 {
    2
}
fn default_a_volume_multiplier_prev() -> f64 {
    3.0
}
fn default_a_volume_multiplier_avg5() -> f64 {
    5.0
}
fn default_a_price_breakout_ratio() -> f64 {
    1.04
}
fn default_a_candle_body_ratio() -> f64 {
    0.7
}
fn default_a_high20_proximity() -> f64 {
    0.99
}
fn default_b_high20_proximity() -> f64 {
    0.95
}
fn default_b_volume_multiplier() -> f64 {
    2.0
}
fn default_c_return_threshold() -> f64 {
    2.0
}
fn default_c_volume_multiplier_prev() -> f64 {
    1.2
}
fn default_c_volume_multiplier_avg5() -> f64 {
    1.5
}

impl ClassificationCriteria {
    fn threshold(&self, tier: Tier) -> Option<u32> {
        match tier {
            Tier::A => Some(self.a_score_threshold),
            Tier::B => Some(self.b_score_threshold),
            Tier::C => Some(self.c_score_threshold),
            Tier::None => None,
        }
    }
}

impl Validate for ClassificationCriteria {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if !(self.a_score_threshold > self.b_score_threshold
            && self.b_score_threshold > self.c_score_threshold
            && self.c_score_threshold > 0)
        {
            errors.push(ValidationError::Conflict {
                reason: format!(
                    "classification thresholds must satisfy A > B > C > 0 (got {}/{}/{})",
                    self.a_score_threshold, self.b_score_threshold, self.c_score_threshold
                ),
            });
        }

        let multipliers = [
            ("a_volume_multiplier_prev", self.a_volume_multiplier_prev),
            ("a_volume_multiplier_avg5", self.a_volume_multiplier_avg5),
            ("a_price_breakout_ratio", self.a_price_breakout_ratio),
            ("a_candle_body_ratio", self.a_candle_body_ratio),
            ("a_high20_proximity", self.a_high20_proximity),
            ("b_high20_proximity", self.b_high20_proximity),
            ("b_volume_multiplier", self.b_volume_multiplier),
            ("c_volume_multiplier_prev", self.c_volume_multiplier_prev),
            ("c_volume_multiplier_avg5", self.c_volume_multiplier_avg5),
        ];
        for (name, value) in multipliers {
            if !(value.is_finite() && value > 0.0) {
                errors.push(ValidationError::InvalidValue {
                    field: format!("classification.{}", name),
                    reason: "must be a positive number".into(),
                });
            }
        }
        if !self.c_return_threshold.is_finite() {
            errors.push(ValidationError::InvalidValue {
                field: "classification.c_return_threshold".into(),
                reason: "must be finite".into(),
            });
        }

        ValidationError::collect(errors)
    }
}

// ============================================================================
// Classifier
// ============================================================================

const FALLBACK_REASON: &str = "multiple conditions met";

/// Deterministic rule-based classifier.
#[derive(Debug, Clone, Default)]
pub struct SignalClassifier {
    criteria: ClassificationCriteria,
}

impl SignalClassifier {
    pub fn new(criteria: ClassificationCriteria) -> Self {
        Self { criteria }
    }

    pub fn criteria(&self) -> &ClassificationCriteria {
        &self.criteria
    }

    /// Classify one indicator set.
    pub fn classify(&self, ind: &IndicatorSet) -> SignalGrade {
        let score = Self::score(ind);

        let tier = Tier::RANKED
            .into_iter()
            .filter(|t| self.criteria.threshold(*t).is_some_and(|th| score >= th))
            .find(|t| self.passes_gate(*t, ind))
            .unwrap_or(Tier::None);

        let reasons = if tier.is_signal() {
            self.reasons(tier, ind)
        } else {
            Vec::new()
        };

        SignalGrade {
            tier,
            score,
            reasons,
        }
    }

    /// Weighted score from the fixed table.
    pub fn score(ind: &IndicatorSet) -> u32 {
        let table: [(bool, u32); 11] = [
            // Price/trend
            (ind.close >= ind.ma20, 1),
            (ind.today_return_pct >= 2.0, 1),
            (ind.close >= ind.high20 * 0.95, 1),
            (ind.close >= ind.high20, 2),
            // Volume
            (ind.volume_today >= ind.volume_prev * 1.5, 1),
            (ind.volume_today >= ind.volume_prev * 3.0, 2),
            (ind.volume_today >= ind.vol_avg5 * 2.0, 1),
            (ind.volume_today >= ind.vol_avg5 * 5.0, 2),
            // Candle/lows
            (ind.has_rising_lows(), 1),
            (ind.close > ind.open, 1),
            (ind.candle_body >= ind.candle_range * 0.7, 2),
        ];

        table
            .iter()
            .filter(|(held, _)| *held)
            .map(|(_, weight)| weight)
            .sum()
    }

    /// Whether the gate for `tier` holds.
    pub fn passes_gate(&self, tier: Tier, ind: &IndicatorSet) -> bool {
        match tier {
            Tier::A => {
                self.a_volume_explosion(ind)
                    && self.a_breakout(ind)
                    && self.a_big_candle(ind)
                    && Self::vcp(ind)
            }
            Tier::B => {
                self.passes_gate(Tier::C, ind)
                    && self.b_near_high(ind)
                    && self.b_volume(ind)
                    && ind.has_rising_lows()
            }
            Tier::C => ind.close >= ind.ma20 && self.c_return(ind) && self.c_volume(ind),
            Tier::None => true,
        }
    }

    fn a_volume_explosion(&self, ind: &IndicatorSet) -> bool {
        self.a_volume_vs_prev(ind) || self.a_volume_vs_avg5(ind)
    }

    fn a_volume_vs_prev(&self, ind: &IndicatorSet) -> bool {
        ind.volume_today >= ind.volume_prev * self.criteria.a_volume_multiplier_prev
    }

    fn a_volume_vs_avg5(&self, ind: &IndicatorSet) -> bool {
        ind.volume_today >= ind.vol_avg5 * self.criteria.a_volume_multiplier_avg5
    }

    fn a_breakout(&self, ind: &IndicatorSet) -> bool {
        ind.close >= ind.high20 * self.criteria.a_high20_proximity
    }

    fn a_big_candle(&self, ind: &IndicatorSet) -> bool {
        ind.close >= ind.open * self.criteria.a_price_breakout_ratio
            && ind.candle_body >= ind.candle_range * self.criteria.a_candle_body_ratio
    }

    /// Volatility contraction with the prior day quieter than average.
    fn vcp(ind: &IndicatorSet) -> bool {
        ind.volatility5 < ind.volatility20 && ind.volume_prev < ind.vol_avg5
    }

    fn b_near_high(&self, ind: &IndicatorSet) -> bool {
        ind.close >= ind.high20 * self.criteria.b_high20_proximity
    }

    fn b_volume(&self, ind: &IndicatorSet) -> bool {
        ind.volume_today >= ind.volume_prev * self.criteria.b_volume_multiplier
            || ind.volume_today >= ind.vol_avg5 * self.criteria.b_volume_multiplier
    }

    fn c_return(&self, ind: &IndicatorSet) -> bool {
        ind.today_return_pct >= self.criteria.c_return_threshold
    }

    fn c_volume(&self, ind: &IndicatorSet) -> bool {
        ind.volume_today >= ind.volume_prev * self.criteria.c_volume_multiplier_prev
            || ind.volume_today >= ind.vol_avg5 * self.criteria.c_volume_multiplier_avg5
    }

    fn reasons(&self, tier: Tier, ind: &IndicatorSet) -> Vec<String> {
        let c = &self.criteria;
        let mut reasons = Vec::new();

        match tier {
            Tier::A => {
                if self.a_volume_vs_prev(ind) {
                    reasons.push(format!("volume >= {}x previous day", c.a_volume_multiplier_prev));
                } else if self.a_volume_vs_avg5(ind) {
                    reasons.push(format!("volume >= {}x 5-day average", c.a_volume_multiplier_avg5));
                }
                if ind.close >= ind.high20 {
                    reasons.push("20-day high breakout".to_string());
                } else if self.a_breakout(ind) {
                    reasons.push("near 20-day high".to_string());
                }
                if self.a_big_candle(ind) {
                    reasons.push(format!(
                        "big bullish candle (body {:.0}%+)",
                        c.a_candle_body_ratio * 100.0
                    ));
                }
                if Self::vcp(ind) {
                    reasons.push("VCP (volatility contraction, volume recovery)".to_string());
                }
            }
            Tier::B => {
                if self.b_near_high(ind) {
                    reasons.push(format!(
                        "within {:.0}% of 20-day high",
                        c.b_high20_proximity * 100.0
                    ));
                }
                if self.b_volume(ind) {
                    reasons.push(format!("volume >= {}x", c.b_volume_multiplier));
                }
                if ind.has_rising_lows() {
                    reasons.push("rising lows".to_string());
                }
                if self.c_return(ind) {
                    reasons.push(format!("today +{}% or more", c.c_return_threshold));
                }
            }
            Tier::C => {
                if ind.close >= ind.ma20 {
                    reasons.push("above MA20".to_string());
                }
                if self.c_return(ind) {
                    reasons.push(format!("today +{}% or more", c.c_return_threshold));
                }
                if self.c_volume(ind) {
                    reasons.push("volume increase".to_string());
                }
            }
            Tier::None => {}
        }

        if reasons.is_empty() {
            reasons.push(FALLBACK_REASON.to_string());
        }
        reasons
    }
}

// ============================================================================
// MA Threshold Filter
// ============================================================================

/// Keeps instruments whose close is at least `threshold_pct` percent above
/// MA20. Matches carry tier `NONE` and score 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaThresholdFilter {
    pub threshold_pct: f64,
    /// Volume filter applies only above 1.0
    pub volume_multiplier: f64,
}

impl MaThresholdFilter {
    pub fn new(threshold_pct: f64, volume_multiplier: f64) -> Self {
        Self {
            threshold_pct,
            volume_multiplier,
        }
    }

    pub fn from_config(config: &StrategyConfig) -> Self {
        Self::new(config.ma_threshold_pct, config.volume_multiplier)
    }

    pub fn evaluate(&self, ind: &IndicatorSet) -> Option<SignalGrade> {
        let gap = ind.ma20_gap_pct()?;
        if gap < self.threshold_pct {
            return None;
        }
        if self.volume_multiplier > 1.0 && ind.volume_today < ind.vol_avg20 * self.volume_multiplier {
            return None;
        }

        let volume_ratio = if ind.vol_avg20 > 0.0 {
            ind.volume_today / ind.vol_avg20
        } else {
            0.0
        };

        Some(SignalGrade {
            tier: Tier::None,
            score: 0,
            reasons: vec![
                format!("{:.2}% above MA20", gap),
                format!("volume {:.2}x 20-day average", volume_ratio),
            ],
        })
    }
}
