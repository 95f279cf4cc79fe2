//! Weighted combination of the trend and smoothing techniques

use super::{Calibration, Estimate, PricePredictor, SmoothingParams, SmoothingPredictor, TrendParams, TrendPredictor};
use crate::error::{EngineError, Result};
use crate::features::FeatureView;
use crate::models::{ArtifactParameters, ModelKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleParams {
    pub trend: TrendParams,
    pub smoothing: SmoothingParams,
    /// Share of the trend member; the smoothing member gets the rest
    pub trend_weight: f64,
    pub calibration: Calibration,
}

impl Default for EnsembleParams {
    fn default() -> Self {
        Self {
            trend: TrendParams::default(),
            smoothing: SmoothingParams::default(),
            trend_weight: 0.5,
            calibration: Calibration::default(),
        }
    }
}

/// Inverse-error weight of the trend member given both members' errors
pub fn inverse_error_weight(trend_error: f64, smoothing_error: f64) -> f64 {
    let eps = 1e-12;
    let t = 1.0 / trend_error.max(eps);
    let s = 1.0 / smoothing_error.max(eps);
    if !(t.is_finite() && s.is_finite()) {
        return 0.5;
    }
    (t / (t + s)).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnsemblePredictor;

impl EnsemblePredictor {
    pub(crate) fn estimate_with(view: &FeatureView<'_>, params: &EnsembleParams) -> Result<Estimate> {
        let trend = TrendPredictor::estimate_with(view, &params.trend)?;
        let smoothing = SmoothingPredictor::estimate_with(view, &params.smoothing)?;
        let w = params.trend_weight.clamp(0.0, 1.0);

        let price = w * trend.price + (1.0 - w) * smoothing.price;
        // Mixture variance: member spread plus disagreement between members
        let variance = w * trend.std_dev.powi(2)
            + (1.0 - w) * smoothing.std_dev.powi(2)
            + w * (1.0 - w) * (trend.price - smoothing.price).powi(2);

        Ok(Estimate {
            price,
            std_dev: variance.sqrt(),
        })
    }
}

impl PricePredictor for EnsemblePredictor {
    fn kind(&self) -> ModelKind {
        ModelKind::PriceEnsemble
    }

    fn estimate(&self, view: &FeatureView<'_>, parameters: &ArtifactParameters) -> Result<Estimate> {
        match parameters {
            ArtifactParameters::Ensemble(params) => Self::estimate_with(view, params),
            other => Err(EngineError::SchemaMismatch {
                expected: ModelKind::PriceEnsemble.to_string(),
                found: other.kind().to_string(),
            }),
        }
    }
}
