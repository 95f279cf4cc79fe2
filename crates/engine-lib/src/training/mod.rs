//! Model training
//!
//! The orchestrator pulls the corpus, fits a candidate on a blocking worker,
//! validates it against the active artifact and either promotes or rejects
//! it. The scheduler re-runs that on an interval.

pub mod fitting;
mod orchestrator;
mod scheduler;

pub use orchestrator::{TrainingDecision, TrainingOrchestrator, TrainingPhase, TrainingReport};
pub use scheduler::{RetrainScheduler, Retrainer};

use crate::models::{ModelKind, ValidationMetrics};
use crate::recommender::ScoringPolicy;
use crate::predictor::DEFAULT_CONFIDENCE_SCALE;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Days ahead each backtest sample forecasts
    pub horizon_days: u32,
    /// Latest share of samples held out for validation
    pub holdout_fraction: f64,
    /// Allowed regression of the primary error against the active model
    pub tolerance: f64,
    pub min_validation_samples: usize,
    /// Days of history pulled per series
    pub corpus_days: u32,
    pub max_origins_per_series: usize,
    /// Districts trained on in addition to each crop's typical districts
    pub extra_districts: Vec<String>,
    pub confidence_scale: f64,
    /// Scoring policy written into recommendation artifacts
    pub policy: ScoringPolicy,
    /// Kinds retrained by the scheduler
    pub scheduled_kinds: Vec<ModelKind>,
    /// Retired versions kept per kind after a promotion
    pub retained_versions: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            horizon_days: 7,
            holdout_fraction: 0.3,
            tolerance: 0.05,
            min_validation_samples: 5,
            corpus_days: 730,
            max_origins_per_series: 60,
            extra_districts: Vec::new(),
            confidence_scale: DEFAULT_CONFIDENCE_SCALE,
            policy: ScoringPolicy::default(),
            scheduled_kinds: vec![ModelKind::PriceEnsemble, ModelKind::CropRecommendation],
            retained_versions: 5,
        }
    }
}

/// Acceptance rule; `Err` carries the rejection reason
pub fn accept(
    candidate: &ValidationMetrics,
    active: Option<&ValidationMetrics>,
    config: &TrainingConfig,
) -> Result<(), String> {
    if !candidate.is_finite() {
        return Err("candidate metrics are not finite".to_string());
    }
    if candidate.samples < config.min_validation_samples {
        return Err(format!(
            "only {} validation samples (need {})",
            candidate.samples, config.min_validation_samples
        ));
    }
    if let Some(active) = active {
        let limit = active.primary_error * (1.0 + config.tolerance.max(0.0));
        if candidate.primary_error > limit {
            return Err(format!(
                "primary error {:.4} exceeds active {:.4} within tolerance {:.2}",
                candidate.primary_error, active.primary_error, config.tolerance
            ));
        }
    }
    Ok(())
}
