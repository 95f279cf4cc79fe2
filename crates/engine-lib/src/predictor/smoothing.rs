//! Damped-trend exponential smoothing
//!
//! The level blends the last price with the short rolling mean; the trend
//! contribution decays geometrically with `phi` so long horizons flatten out
//! instead of extrapolating the slope forever.

use super::{noise_floor, Calibration, Estimate, PricePredictor};
use crate::error::{EngineError, Result};
use crate::features::FeatureView;
use crate::models::{ArtifactParameters, ModelKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothingParams {
    /// Weight of the last price against the short rolling mean
    pub alpha: f64,
    /// Trend damping factor in (0, 1]
    pub phi: f64,
    /// Rolling window (days) used as the smoothed level
    pub short_window: u32,
    pub calibration: Calibration,
}

impl Default for SmoothingParams {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            phi: 0.9,
            short_window: 7,
            calibration: Calibration::default(),
        }
    }
}

/// Sum of phi^i for i in 1..=h
fn damped_steps(phi: f64, horizon: f64) -> f64 {
    if horizon <= 0.0 {
        return 0.0;
    }
    if (1.0 - phi).abs() < 1e-9 {
        return horizon;
    }
    phi * (1.0 - phi.powf(horizon)) / (1.0 - phi)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SmoothingPredictor;

impl SmoothingPredictor {
    pub(crate) fn estimate_with(view: &FeatureView<'_>, params: &SmoothingParams) -> Result<Estimate> {
        let window = pick_window(view, params.short_window)?;
        let last_price = view.get("last_price")?;
        let short_mean = view.get(&format!("mean_{}", window))?;
        let short_var = view.get(&format!("var_{}", window))?;
        let slope = view.get("trend_slope")?;
        let residual = view.get("trend_residual_std")?;
        let horizon = view.get("horizon_days")?;

        let alpha = params.alpha.clamp(0.0, 1.0);
        let phi = params.phi.clamp(0.0, 1.0);
        let level = alpha * last_price + (1.0 - alpha) * short_mean;
        let price = level + slope * damped_steps(phi, horizon);

        let base = residual
            .max(short_var.max(0.0).sqrt())
            .max(noise_floor(last_price));
        let growth = 1.0 + (horizon - 1.0).max(0.0) * alpha * alpha;

        Ok(Estimate {
            price,
            std_dev: base * growth.sqrt(),
        })
    }
}

/// `requested` when the layout has it, otherwise the shortest window present
fn pick_window(view: &FeatureView<'_>, requested: u32) -> Result<u32> {
    let windows = view.schema().windows();
    if windows.contains(&requested) {
        return Ok(requested);
    }
    windows.first().copied().ok_or_else(|| EngineError::SchemaMismatch {
        expected: "at least one rolling window".to_string(),
        found: view.schema().fingerprint(),
    })
}

impl PricePredictor for SmoothingPredictor {
    fn kind(&self) -> ModelKind {
        ModelKind::PriceSmoothing
    }

    fn estimate(&self, view: &FeatureView<'_>, parameters: &ArtifactParameters) -> Result<Estimate> {
        match parameters {
            ArtifactParameters::Smoothing(params) => Self::estimate_with(view, params),
            other => Err(EngineError::SchemaMismatch {
                expected: ModelKind::PriceSmoothing.to_string(),
                found: other.kind().to_string(),
            }),
        }
    }
}
