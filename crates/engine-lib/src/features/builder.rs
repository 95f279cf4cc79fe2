//! Feature extraction for price forecasting
//!
//! Turns a normalized price history into the fixed-layout vector described
//! by [`FeatureSchema`]: rolling statistics per window, a linear trend over
//! the longest window, a detrended month-of-year adjustment, season phase and
//! the categorical identity codes.

use super::encoding::IdentityEncoder;
use super::schema::FeatureSchema;
use super::series::DailySeries;
use super::stats::{fit_line, mean, variance, LinearFit};
use crate::error::{EngineError, Result};
use crate::models::{FeatureVector, PriceObservation, Season};
use chrono::{Datelike, NaiveDate};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Minimum number of observations required to build features
pub const MIN_OBSERVATIONS: usize = 3;

/// Bounds applied to the month-of-year adjustment ratio
const SEASONAL_ADJUSTMENT_BOUNDS: (f64, f64) = (0.5, 2.0);

/// Observations a month needs before it gets its own seasonal index
const MIN_MONTH_OBSERVATIONS: usize = 2;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Rolling windows in days
    pub windows: Vec<u32>,
    /// Longest gap (days) filled by interpolation
    pub max_interpolation_gap: u32,
    pub min_observations: usize,
    pub encoding_buckets: u32,
    /// Furthest target date accepted, in days past the last observation
    pub max_horizon_days: u32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            windows: vec![7, 30, 90],
            max_interpolation_gap: 7,
            min_observations: MIN_OBSERVATIONS,
            encoding_buckets: 1024,
            max_horizon_days: 365,
        }
    }
}

/// Builds [`FeatureVector`]s from price history
#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    config: FeatureConfig,
    encoder: IdentityEncoder,
    schema: FeatureSchema,
}

impl FeatureBuilder {
    pub fn new(mut config: FeatureConfig) -> Self {
        config.windows.retain(|w| *w > 0);
        config.windows.sort_unstable();
        config.windows.dedup();
        if config.windows.is_empty() {
            config.windows = FeatureConfig::default().windows;
        }
        config.min_observations = config.min_observations.max(MIN_OBSERVATIONS);

        let encoder = IdentityEncoder::new(config.encoding_buckets);
        let schema = FeatureSchema::for_windows(&config.windows, encoder.buckets());
        Self {
            config,
            encoder,
            schema,
        }
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn min_observations(&self) -> usize {
        self.config.min_observations
    }

    pub fn has_sufficient_data(&self, history: &[PriceObservation]) -> bool {
        history.len() >= self.config.min_observations
    }

    /// Features for forecasting the price on `target_date` from `history`
    /// (sorted oldest first, one series)
    pub fn build(&self, history: &[PriceObservation], target_date: NaiveDate) -> Result<FeatureVector> {
        if !self.has_sufficient_data(history) {
            return Err(EngineError::InsufficientData {
                required: self.config.min_observations,
                found: history.len(),
            });
        }
        let first = &history[0];
        let last_observation = &history[history.len() - 1];

        let series = DailySeries::from_observations(history, self.config.max_interpolation_gap);
        let last = match series.last() {
            Some(point) => *point,
            None => {
                return Err(EngineError::InsufficientData {
                    required: self.config.min_observations,
                    found: 0,
                })
            }
        };

        if target_date < last.day {
            return Err(EngineError::invalid(format!(
                "target date {} precedes last observation {}",
                target_date, last.day
            )));
        }
        let horizon = (target_date - last.day).num_days();
        if horizon > self.config.max_horizon_days as i64 {
            return Err(EngineError::invalid(format!(
                "target date {} is {} days past the last observation (max {})",
                target_date, horizon, self.config.max_horizon_days
            )));
        }

        let mut numeric = Vec::with_capacity(self.schema.numeric.len());
        numeric.push(last.price);

        for window in &self.config.windows {
            let prices: Vec<f64> = series.trailing(*window).iter().map(|p| p.price).collect();
            numeric.push(mean(&prices));
            numeric.push(variance(&prices));
        }

        let longest = self.config.windows.last().copied().unwrap_or(90);
        let trend = trend_fit(&series, longest, last.day);
        numeric.push(trend.map(|f| f.intercept).unwrap_or(last.price));
        numeric.push(trend.map(|f| f.slope).unwrap_or(0.0));
        numeric.push(trend.map(|f| f.residual_std).unwrap_or(0.0));
        numeric.push(trend.map(|f| f.points as f64).unwrap_or(1.0));
        numeric.push(trend.map(|f| -f.x_mean).unwrap_or(0.0));
        numeric.push(trend.map(|f| f.sxx).unwrap_or(0.0));

        numeric.push(seasonal_adjustment(&series, last.day, target_date));

        let phase = 2.0 * std::f64::consts::PI * target_date.ordinal() as f64 / 365.25;
        numeric.push(phase.sin());
        numeric.push(phase.cos());
        numeric.push(horizon as f64);
        numeric.push(series.excluded_days() as f64);

        let categorical = vec![
            self.encoder.encode(&first.crop_id),
            self.encoder.encode(&first.district),
            Season::for_date(target_date).code(),
        ];

        Ok(FeatureVector {
            crop_id: first.crop_id.clone(),
            district: first.district.clone(),
            timestamp: last_observation.timestamp,
            target_date,
            numeric,
            categorical,
            schema_fingerprint: self.schema.fingerprint(),
        })
    }
}

/// Line through the trailing window, with x measured in days relative to `anchor`
fn trend_fit(series: &DailySeries, window: u32, anchor: NaiveDate) -> Option<LinearFit> {
    let points: Vec<(f64, f64)> = series
        .trailing(window)
        .iter()
        .map(|p| ((p.day - anchor).num_days() as f64, p.price))
        .collect();
    fit_line(&points)
}

/// Ratio of the detrended price level in the target month to the last observed month
fn seasonal_adjustment(series: &DailySeries, anchor: NaiveDate, target: NaiveDate) -> f64 {
    let observed: Vec<(NaiveDate, f64)> = series.observed().map(|p| (p.day, p.price)).collect();
    let points: Vec<(f64, f64)> = observed
        .iter()
        .map(|(day, price)| ((*day - anchor).num_days() as f64, *price))
        .collect();
    let Some(fit) = fit_line(&points) else {
        return 1.0;
    };
    let level = mean(&observed.iter().map(|(_, p)| *p).collect::<Vec<_>>());
    if level <= f64::EPSILON {
        return 1.0;
    }

    let mut residuals: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
    for ((day, price), (x, _)) in observed.iter().zip(points.iter()) {
        residuals
            .entry(day.month())
            .or_default()
            .push(price - fit.at(*x));
    }
    let index = |month: u32| -> f64 {
        match residuals.get(&month) {
            Some(values) if values.len() >= MIN_MONTH_OBSERVATIONS => 1.0 + mean(values) / level,
            _ => 1.0,
        }
    };

    let current = index(anchor.month());
    if current <= f64::EPSILON {
        return 1.0;
    }
    (index(target.month()) / current).clamp(SEASONAL_ADJUSTMENT_BOUNDS.0, SEASONAL_ADJUSTMENT_BOUNDS.1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn daily_series(days: i64, f: impl Fn(i64) -> f64) -> Vec<PriceObservation> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap();
        (0..days)
            .map(|d| PriceObservation::new("rice", "Thanjavur", base + Duration::days(d), f(d)))
            .collect()
    }

    fn value(builder: &FeatureBuilder, vector: &FeatureVector, name: &str) -> f64 {
        builder.schema().view(vector).unwrap().get(name).unwrap()
    }

    #[test]
    fn test_insufficient_samples() {
        let builder = FeatureBuilder::new(FeatureConfig::default());
        let history = daily_series(2, |d| 20.0 + d as f64);
        let err = builder
            .build(&history, NaiveDate::from_ymd_opt(2024, 1, 9).unwrap())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientData {
                required: 3,
                found: 2
            }
        ));
    }

    #[test]
    fn test_dimensionality_matches_schema() {
        let builder = FeatureBuilder::new(FeatureConfig::default());
        let history = daily_series(40, |d| 20.0 + 0.1 * d as f64);
        let vector = builder
            .build(&history, NaiveDate::from_ymd_opt(2024, 2, 16).unwrap())
            .unwrap();
        assert_eq!(vector.numeric.len(), builder.schema().numeric.len());
        assert_eq!(vector.categorical.len(), builder.schema().categorical.len());
        assert_eq!(vector.schema_fingerprint, builder.schema().fingerprint());
        assert_eq!(vector.categorical[2], Season::Zaid.code());
    }

    #[test]
    fn test_trend_and_horizon_features() {
        let builder = FeatureBuilder::new(FeatureConfig::default());
        let history = daily_series(90, |d| 20.0 + 0.1 * d as f64);
        // Last observation is 2024-03-30
        let target = NaiveDate::from_ymd_opt(2024, 4, 6).unwrap();
        let vector = builder.build(&history, target).unwrap();

        assert!((value(&builder, &vector, "trend_slope") - 0.1).abs() < 1e-9);
        assert!((value(&builder, &vector, "trend_level") - 28.9).abs() < 1e-6);
        assert!(value(&builder, &vector, "trend_residual_std") < 1e-6);
        assert_eq!(value(&builder, &vector, "horizon_days"), 7.0);
        assert!((value(&builder, &vector, "mean_7") - 28.6).abs() < 1e-6);
        assert!((value(&builder, &vector, "seasonal_adjustment") - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_long_gap_excluded_from_rolling_stats() {
        let builder = FeatureBuilder::new(FeatureConfig::default());
        let mut history = daily_series(10, |_| 10.0);
        let base = Utc.with_ymd_and_hms(2024, 2, 1, 6, 0, 0).unwrap();
        for d in 0..5 {
            history.push(PriceObservation::new("rice", "Thanjavur", base + Duration::days(d), 50.0));
        }
        let vector = builder
            .build(&history, NaiveDate::from_ymd_opt(2024, 2, 10).unwrap())
            .unwrap();

        // Jan 10 .. Feb 1 is a 21-day hole: nothing interpolated into it
        assert_eq!(value(&builder, &vector, "excluded_gap_days"), 21.0);
        assert_eq!(value(&builder, &vector, "mean_7"), 50.0);
        let mean_30 = value(&builder, &vector, "mean_30");
        // Jan 7..10 and Feb 1..5 fall inside the trailing 30 days
        assert!((mean_30 - (10.0 * 4.0 + 50.0 * 5.0) / 9.0).abs() < 1e-9, "mean_30 was {}", mean_30);
    }

    #[test]
    fn test_target_before_last_observation_rejected() {
        let builder = FeatureBuilder::new(FeatureConfig::default());
        let history = daily_series(10, |_| 10.0);
        let err = builder
            .build(&history, NaiveDate::from_ymd_opt(2023, 12, 1).unwrap())
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn test_horizon_bound_enforced() {
        let builder = FeatureBuilder::new(FeatureConfig {
            max_horizon_days: 30,
            ..Default::default()
        });
        let history = daily_series(10, |_| 10.0);
        assert!(builder
            .build(&history, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
            .is_err());
    }

    #[test]
    fn test_windows_sanitized() {
        let builder = FeatureBuilder::new(FeatureConfig {
            windows: vec![30, 0, 7, 30],
            min_observations: 1,
            ..Default::default()
        });
        assert_eq!(builder.schema().windows(), vec![7, 30]);
        assert_eq!(builder.min_observations(), MIN_OBSERVATIONS);
    }
}
