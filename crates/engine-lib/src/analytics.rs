//! Market summary statistics over a price window

use crate::features::stats::{mean, population_std_dev};
use crate::models::PriceObservation;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Percent change beyond which a window is labelled as trending
const TREND_THRESHOLD_PERCENT: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceTrend {
    Increasing,
    Decreasing,
    Stable,
}

impl PriceTrend {
    pub fn from_change(change_percent: f64) -> Self {
        if change_percent > TREND_THRESHOLD_PERCENT {
            PriceTrend::Increasing
        } else if change_percent < -TREND_THRESHOLD_PERCENT {
            PriceTrend::Decreasing
        } else {
            PriceTrend::Stable
        }
    }

    /// Short guidance for growers
    pub fn advice(&self) -> &'static str {
        match self {
            PriceTrend::Increasing => "Prices are rising; consider holding stock for better rates",
            PriceTrend::Decreasing => "Prices are falling; consider selling early",
            PriceTrend::Stable => "Prices are steady; sell according to your usual schedule",
        }
    }
}

impl fmt::Display for PriceTrend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PriceTrend::Increasing => "increasing",
            PriceTrend::Decreasing => "decreasing",
            PriceTrend::Stable => "stable",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceSummary {
    pub average: f64,
    pub min: f64,
    pub max: f64,
    /// Last price against the first, in percent
    pub change_percent: f64,
    /// Population standard deviation of prices
    pub volatility: f64,
    pub trend: PriceTrend,
    pub observation_count: usize,
}

/// Statistics for a window together with the observations they were computed from
#[derive(Debug, Clone, Serialize)]
pub struct MarketAnalytics {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub days: u32,
    pub summary: PriceSummary,
    /// Oldest first, across every matching series
    pub observations: Vec<PriceObservation>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Summary of `observations` (oldest first); zeros and `stable` when empty
pub fn summarize(observations: &[PriceObservation]) -> PriceSummary {
    let (Some(first), Some(last)) = (observations.first(), observations.last()) else {
        return PriceSummary {
            average: 0.0,
            min: 0.0,
            max: 0.0,
            change_percent: 0.0,
            volatility: 0.0,
            trend: PriceTrend::Stable,
            observation_count: 0,
        };
    };
    let prices: Vec<f64> = observations.iter().map(|o| o.price).collect();
    let min = prices.iter().copied().fold(f64::INFINITY, f64::min);
    let max = prices.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let change_percent = if first.price > 0.0 {
        (last.price - first.price) / first.price * 100.0
    } else {
        0.0
    };

    PriceSummary {
        average: round2(mean(&prices)),
        min: round2(min),
        max: round2(max),
        change_percent: round2(change_percent),
        volatility: round2(population_std_dev(&prices)),
        trend: PriceTrend::from_change(change_percent),
        observation_count: prices.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn prices(values: &[f64]) -> Vec<PriceObservation> {
        let base = Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, p)| PriceObservation::new("onion", "Erode", base + Duration::days(i as i64), *p))
            .collect()
    }

    #[test]
    fn test_summary_values() {
        let summary = summarize(&prices(&[20.0, 22.0, 24.0, 22.0]));
        assert_eq!(summary.average, 22.0);
        assert_eq!(summary.min, 20.0);
        assert_eq!(summary.max, 24.0);
        assert_eq!(summary.change_percent, 10.0);
        assert_eq!(summary.volatility, 1.41);
        assert_eq!(summary.trend, PriceTrend::Increasing);
        assert_eq!(summary.observation_count, 4);
    }

    #[test]
    fn test_trend_labels() {
        assert_eq!(PriceTrend::from_change(5.0), PriceTrend::Stable);
        assert_eq!(PriceTrend::from_change(-5.01), PriceTrend::Decreasing);
        assert_eq!(summarize(&prices(&[30.0, 27.0])).trend, PriceTrend::Decreasing);
        assert_eq!(PriceTrend::Decreasing.to_string(), "decreasing");
    }

    #[test]
    fn test_empty_window() {
        let summary = summarize(&[]);
        assert_eq!(summary.observation_count, 0);
        assert_eq!(summary.average, 0.0);
        assert_eq!(summary.trend, PriceTrend::Stable);
    }
}
