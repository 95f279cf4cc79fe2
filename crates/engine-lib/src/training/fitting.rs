//! Candidate fitting and backtest validation
//!
//! Everything here is synchronous and CPU-bound; the orchestrator runs it on
//! a blocking worker.

use super::TrainingConfig;
use crate::catalog::CropCatalog;
use crate::error::{EngineError, Result};
use crate::features::stats::mean;
use crate::features::FeatureBuilder;
use crate::models::{ArtifactParameters, FeatureVector, ModelKind, PriceObservation, ValidationMetrics};
use crate::predictor::{
    bound, inverse_error_weight, predictor_for, Calibration, EnsembleParams, Estimate, SmoothingParams,
    TrendParams,
};
use crate::recommender::{CandidateSignals, RecommendationParams};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

const SEASONAL_WEIGHT_GRID: &[f64] = &[0.0, 0.5, 1.0];
const ALPHA_GRID: &[f64] = &[0.2, 0.5, 0.8];
const PHI_GRID: &[f64] = &[0.8, 0.9, 0.98];
const INTERVAL_SCALE_BOUNDS: (f64, f64) = (0.5, 4.0);
const VALIDATION_FOLDS: usize = 5;

/// One backtest case: features as of an origin and the price later observed
#[derive(Debug, Clone)]
pub struct Sample {
    pub features: FeatureVector,
    pub actual: f64,
    pub origin: DateTime<Utc>,
}

/// Samples split chronologically into fitting and holdout sets
#[derive(Debug, Default)]
pub struct SampleSplit {
    pub train: Vec<Sample>,
    pub holdout: Vec<Sample>,
}

/// Fitted candidate before it is wrapped into an artifact
#[derive(Debug, Clone)]
pub struct FittedCandidate {
    pub parameters: ArtifactParameters,
    pub metrics: ValidationMetrics,
    pub training_samples: usize,
}

/// Backtest samples from one series, oldest origin first
pub fn series_samples(
    builder: &FeatureBuilder,
    history: &[PriceObservation],
    config: &TrainingConfig,
) -> Vec<Sample> {
    let min = builder.min_observations();
    if history.len() <= min {
        return Vec::new();
    }
    let origins = history.len() - min;
    let stride = origins.div_ceil(config.max_origins_per_series.max(1)).max(1);
    let horizon = Duration::days(config.horizon_days.max(1) as i64);

    let mut samples = Vec::new();
    for end in (min..history.len()).step_by(stride) {
        let origin = &history[end - 1];
        let due = origin.day() + horizon;
        let Some(target) = history[end..].iter().find(|o| o.day() >= due) else {
            break;
        };
        // Targets past the builder's horizon bound are skipped
        if let Ok(features) = builder.build(&history[..end], target.day()) {
            samples.push(Sample {
                features,
                actual: target.price,
                origin: origin.timestamp,
            });
        }
    }
    samples
}

/// Chronological split keeping the latest `holdout_fraction` for validation
pub fn split_samples(mut samples: Vec<Sample>, holdout_fraction: f64) -> SampleSplit {
    samples.sort_by(|a, b| {
        a.origin
            .cmp(&b.origin)
            .then_with(|| a.features.crop_id.cmp(&b.features.crop_id))
            .then_with(|| a.features.district.cmp(&b.features.district))
    });
    let fraction = holdout_fraction.clamp(0.0, 0.9);
    let holdout_len = ((samples.len() as f64) * fraction).round() as usize;
    let holdout = samples.split_off(samples.len() - holdout_len.min(samples.len()));
    SampleSplit {
        train: samples,
        holdout,
    }
}

fn estimates(builder: &FeatureBuilder, parameters: &ArtifactParameters, samples: &[Sample]) -> Result<Vec<Estimate>> {
    let predictor = predictor_for(parameters.kind())
        .ok_or_else(|| EngineError::Training(format!("{} is not a price model", parameters.kind())))?;
    samples
        .iter()
        .map(|s| {
            let view = builder.schema().view(&s.features)?;
            predictor.estimate(&view, parameters)
        })
        .collect()
}

fn mse(estimates: &[Estimate], samples: &[Sample]) -> f64 {
    let errors: Vec<f64> = estimates
        .iter()
        .zip(samples)
        .map(|(e, s)| (s.actual - e.price).powi(2))
        .collect();
    mean(&errors)
}

/// Parameters from `grid` with the lowest training error; first wins ties
fn best_of(
    builder: &FeatureBuilder,
    grid: Vec<ArtifactParameters>,
    samples: &[Sample],
) -> Result<(ArtifactParameters, f64)> {
    let mut best: Option<(ArtifactParameters, f64)> = None;
    for candidate in grid {
        let error = mse(&estimates(builder, &candidate, samples)?, samples);
        if !error.is_finite() {
            continue;
        }
        if best.as_ref().map_or(true, |(_, e)| error < *e) {
            best = Some((candidate, error));
        }
    }
    best.ok_or_else(|| EngineError::Training("no candidate produced finite errors".to_string()))
}

/// Interval scale that makes the training z-scores unit RMS
fn calibrate(estimates: &[Estimate], samples: &[Sample], confidence_scale: f64) -> Calibration {
    let z2: Vec<f64> = estimates
        .iter()
        .zip(samples)
        .filter(|(e, _)| e.std_dev > f64::EPSILON)
        .map(|(e, s)| ((s.actual - e.price) / e.std_dev).powi(2))
        .collect();
    let interval_scale = if z2.is_empty() {
        1.0
    } else {
        mean(&z2)
            .sqrt()
            .clamp(INTERVAL_SCALE_BOUNDS.0, INTERVAL_SCALE_BOUNDS.1)
    };
    Calibration {
        interval_scale,
        confidence_scale,
    }
}

fn with_calibration(parameters: ArtifactParameters, calibration: Calibration) -> ArtifactParameters {
    match parameters {
        ArtifactParameters::Trend(p) => ArtifactParameters::Trend(TrendParams { calibration, ..p }),
        ArtifactParameters::Smoothing(p) => ArtifactParameters::Smoothing(SmoothingParams { calibration, ..p }),
        ArtifactParameters::Ensemble(p) => ArtifactParameters::Ensemble(EnsembleParams { calibration, ..p }),
        other => other,
    }
}

fn trend_grid() -> Vec<ArtifactParameters> {
    SEASONAL_WEIGHT_GRID
        .iter()
        .map(|w| {
            ArtifactParameters::Trend(TrendParams {
                seasonal_weight: *w,
                ..Default::default()
            })
        })
        .collect()
}

fn smoothing_grid(short_window: u32) -> Vec<ArtifactParameters> {
    let mut grid = Vec::new();
    for alpha in ALPHA_GRID {
        for phi in PHI_GRID {
            grid.push(ArtifactParameters::Smoothing(SmoothingParams {
                alpha: *alpha,
                phi: *phi,
                short_window,
                ..Default::default()
            }));
        }
    }
    grid
}

/// Backtest `parameters` on the holdout set
pub fn validate(builder: &FeatureBuilder, parameters: &ArtifactParameters, holdout: &[Sample]) -> Result<ValidationMetrics> {
    let calibration = crate::predictor::calibration_of(parameters);
    let raw = estimates(builder, parameters, holdout)?;

    let mut abs_pct = Vec::with_capacity(holdout.len());
    let mut sq = Vec::with_capacity(holdout.len());
    let mut covered = 0usize;
    for (estimate, sample) in raw.iter().zip(holdout) {
        let view = builder.schema().view(&sample.features)?;
        let forecast = bound(&view, *estimate, calibration)?;
        abs_pct.push((sample.actual - forecast.price).abs() / sample.actual.abs().max(f64::EPSILON));
        sq.push((sample.actual - forecast.price).powi(2));
        if sample.actual >= forecast.lower && sample.actual <= forecast.upper {
            covered += 1;
        }
    }

    let samples = holdout.len();
    let mape = mean(&abs_pct);
    Ok(ValidationMetrics {
        primary_error: mape,
        mape: Some(mape),
        rmse: Some(mean(&sq).sqrt()),
        interval_coverage: (samples > 0).then(|| covered as f64 / samples as f64),
        samples,
    })
}

/// Fit a price model of `kind` on the split's training samples
pub fn fit_price_model(
    kind: ModelKind,
    builder: &FeatureBuilder,
    split: &SampleSplit,
    config: &TrainingConfig,
) -> Result<FittedCandidate> {
    if split.train.is_empty() {
        return Err(EngineError::Training("no training samples in the corpus".to_string()));
    }
    let train = &split.train;
    let short_window = builder.schema().windows().first().copied().unwrap_or(7);

    let parameters = match kind {
        ModelKind::PriceTrend => best_of(builder, trend_grid(), train)?.0,
        ModelKind::PriceSmoothing => best_of(builder, smoothing_grid(short_window), train)?.0,
        ModelKind::PriceEnsemble => {
            let (trend, trend_error) = best_of(builder, trend_grid(), train)?;
            let (smoothing, smoothing_error) = best_of(builder, smoothing_grid(short_window), train)?;
            match (trend, smoothing) {
                (ArtifactParameters::Trend(trend), ArtifactParameters::Smoothing(smoothing)) => {
                    ArtifactParameters::Ensemble(EnsembleParams {
                        trend,
                        smoothing,
                        trend_weight: inverse_error_weight(trend_error, smoothing_error),
                        calibration: Calibration::default(),
                    })
                }
                _ => return Err(EngineError::Training("ensemble members fitted to wrong kinds".to_string())),
            }
        }
        ModelKind::CropRecommendation => {
            return Err(EngineError::Training(format!("{} is not a price model", kind)))
        }
    };

    let calibration = calibrate(&estimates(builder, &parameters, train)?, train, config.confidence_scale);
    let parameters = with_calibration(parameters, calibration);
    let metrics = validate(builder, &parameters, &split.holdout)?;

    Ok(FittedCandidate {
        parameters,
        metrics,
        training_samples: train.len(),
    })
}

/// Learn (district, season, crop) affinities from seasonal margins
///
/// Validation is an interleaved k-fold: each fold's affinity is compared
/// with the affinity learned from the remaining observations, so stable
/// margins give a low error.
pub fn fit_recommendation_model(
    catalog: &CropCatalog,
    corpus: &[Vec<PriceObservation>],
    config: &TrainingConfig,
) -> Result<FittedCandidate> {
    let mut affinities = BTreeMap::new();
    let mut disagreements = Vec::new();
    let mut observations = 0usize;

    for history in corpus {
        let Some(first) = history.first() else {
            continue;
        };
        let Some(crop) = catalog.get(&first.crop_id) else {
            continue;
        };
        observations += history.len();
        let folds: Vec<(Vec<PriceObservation>, Vec<PriceObservation>)> = (0..VALIDATION_FOLDS)
            .map(|fold| {
                let (held, rest): (Vec<_>, Vec<_>) = history
                    .iter()
                    .enumerate()
                    .partition(|(i, _)| i % VALIDATION_FOLDS == fold);
                (
                    held.into_iter().map(|(_, o)| o.clone()).collect(),
                    rest.into_iter().map(|(_, o)| o.clone()).collect(),
                )
            })
            .collect();

        for season in &crop.seasons {
            let Some(full) = CandidateSignals::from_history(history, *season) else {
                continue;
            };
            affinities.insert(
                RecommendationParams::affinity_key(&first.district, *season, &crop.crop_id),
                full.margin_affinity(),
            );
            for (held, rest) in &folds {
                if let (Some(a), Some(b)) = (
                    CandidateSignals::from_history(held, *season),
                    CandidateSignals::from_history(rest, *season),
                ) {
                    disagreements.push((a.margin_affinity() - b.margin_affinity()).abs());
                }
            }
        }
    }

    if affinities.is_empty() {
        return Err(EngineError::Training(
            "no catalog crop has price history to learn affinities from".to_string(),
        ));
    }

    let samples = disagreements.len();
    let parameters = ArtifactParameters::Recommendation(RecommendationParams {
        policy: config.policy.clone(),
        affinities,
        ..Default::default()
    });
    Ok(FittedCandidate {
        parameters,
        metrics: ValidationMetrics {
            primary_error: mean(&disagreements),
            mape: None,
            rmse: None,
            interval_coverage: None,
            samples,
        },
        training_samples: observations,
    })
}
