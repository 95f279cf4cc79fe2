//! Candidate signals and the per-user-type scoring policy

use crate::features::stats::{fit_line, mean, population_std_dev};
use crate::models::{PriceObservation, Season, UserType};
use chrono::Datelike;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sensitivity of the return signal to the seasonal margin
const MARGIN_GAIN: f64 = 4.0;
/// Sensitivity of the return signal to the monthly relative trend
const TREND_GAIN: f64 = 2.0;
/// Sensitivity of the stability signal to the coefficient of variation
const VOLATILITY_GAIN: f64 = 3.0;

/// Relative weights of the three scoring signals
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub return_weight: f64,
    pub stability_weight: f64,
    pub affinity_weight: f64,
}

impl ScoringWeights {
    pub const fn new(return_weight: f64, stability_weight: f64, affinity_weight: f64) -> Self {
        Self {
            return_weight,
            stability_weight,
            affinity_weight,
        }
    }

    /// Weighted mean of the signals; each signal is in [0, 1] so the score is too
    pub fn combine(&self, return_signal: f64, stability: f64, affinity: f64) -> f64 {
        let r = self.return_weight.max(0.0);
        let s = self.stability_weight.max(0.0);
        let a = self.affinity_weight.max(0.0);
        let total = r + s + a;
        if total <= f64::EPSILON {
            return 0.0;
        }
        ((r * return_signal + s * stability + a * affinity) / total).clamp(0.0, 1.0)
    }
}

/// Signal weights per user type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    /// Risk-averse: stability dominates
    pub farmer: ScoringWeights,
    /// Yield-weighted: return dominates
    pub commercial: ScoringWeights,
    pub buyer: ScoringWeights,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            farmer: ScoringWeights::new(0.3, 0.5, 0.2),
            commercial: ScoringWeights::new(0.65, 0.1, 0.25),
            buyer: ScoringWeights::new(0.4, 0.4, 0.2),
        }
    }
}

impl ScoringPolicy {
    pub fn weights_for(&self, user_type: UserType) -> &ScoringWeights {
        match user_type {
            UserType::Farmer => &self.farmer,
            UserType::Commercial => &self.commercial,
            UserType::Buyer => &self.buyer,
        }
    }
}

/// Trained parameters of the crop recommendation model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationParams {
    pub policy: ScoringPolicy,
    /// Learned affinity in [0, 1] keyed by `district|season|crop`
    pub affinities: BTreeMap<String, f64>,
    /// Affinity of combinations absent from training
    pub default_affinity: f64,
    /// Multiplier on affinity when the district is not typical for the crop
    pub off_district_factor: f64,
}

impl Default for RecommendationParams {
    fn default() -> Self {
        Self {
            policy: ScoringPolicy::default(),
            affinities: BTreeMap::new(),
            default_affinity: 0.5,
            off_district_factor: 0.8,
        }
    }
}

impl RecommendationParams {
    pub fn affinity_key(district: &str, season: Season, crop_id: &str) -> String {
        format!(
            "{}|{}|{}",
            district.trim().to_lowercase(),
            season,
            crop_id.trim().to_lowercase()
        )
    }

    pub fn affinity(&self, district: &str, season: Season, crop_id: &str) -> f64 {
        self.affinities
            .get(&Self::affinity_key(district, season, crop_id))
            .copied()
            .unwrap_or(self.default_affinity)
            .clamp(0.0, 1.0)
    }
}

/// Market statistics of one candidate crop in one district
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateSignals {
    /// Mean in-season price over the mean price of the whole window
    pub seasonal_margin: f64,
    /// Fitted slope as a share of the mean price, per 30 days
    pub relative_trend: f64,
    pub coefficient_of_variation: f64,
    pub observations: usize,
}

impl CandidateSignals {
    /// `None` for an empty history or a non-positive mean price
    pub fn from_history(history: &[PriceObservation], season: Season) -> Option<Self> {
        let first = history.first()?;
        let prices: Vec<f64> = history.iter().map(|o| o.price).collect();
        let level = mean(&prices);
        if level <= f64::EPSILON {
            return None;
        }

        let in_season: Vec<f64> = history
            .iter()
            .filter(|o| season.contains_month(o.timestamp.month()))
            .map(|o| o.price)
            .collect();
        let seasonal_margin = if in_season.is_empty() {
            1.0
        } else {
            mean(&in_season) / level
        };

        let points: Vec<(f64, f64)> = history
            .iter()
            .map(|o| ((o.timestamp - first.timestamp).num_seconds() as f64 / 86_400.0, o.price))
            .collect();
        let relative_trend = fit_line(&points)
            .map(|fit| fit.slope * 30.0 / level)
            .unwrap_or(0.0);

        Some(Self {
            seasonal_margin,
            relative_trend,
            coefficient_of_variation: population_std_dev(&prices) / level,
            observations: history.len(),
        })
    }

    pub fn return_signal(&self) -> f64 {
        let x = (self.seasonal_margin - 1.0) * MARGIN_GAIN + self.relative_trend * TREND_GAIN;
        0.5 + 0.5 * x.tanh()
    }

    pub fn stability_signal(&self) -> f64 {
        1.0 - (self.coefficient_of_variation.max(0.0) * VOLATILITY_GAIN).tanh()
    }

    /// Affinity learned from the seasonal margin alone
    pub fn margin_affinity(&self) -> f64 {
        0.5 + 0.5 * ((self.seasonal_margin - 1.0) * MARGIN_GAIN).tanh()
    }
}
