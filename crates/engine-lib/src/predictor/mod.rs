//! Price prediction engine
//!
//! Each technique implements [`PricePredictor`]; the concrete variant is
//! picked by [`ModelKind`]. A technique only produces a point estimate and
//! its standard deviation. Calibration, the 95% interval and the confidence
//! score are derived from that estimate the same way for every technique.

mod ensemble;
mod smoothing;
mod trend;

pub use ensemble::{inverse_error_weight, EnsembleParams, EnsemblePredictor};
pub use smoothing::{SmoothingParams, SmoothingPredictor};
pub use trend::{TrendParams, TrendPredictor};

use crate::error::{EngineError, Result};
use crate::features::FeatureView;
use crate::models::{ArtifactParameters, FeatureVector, ForecastResult, ModelArtifact, ModelKind};
use serde::{Deserialize, Serialize};

/// z-value of a two-sided 95% interval
pub const INTERVAL_Z: f64 = 1.96;

/// Forecasts never drop below this share of the last observed price
pub const PRICE_FLOOR_RATIO: f64 = 0.01;

/// Default relative half-width at which confidence falls to 1/e
pub const DEFAULT_CONFIDENCE_SCALE: f64 = 0.25;

/// Raw technique output before calibration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub price: f64,
    pub std_dev: f64,
}

/// Uncertainty calibration learned at training time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Multiplier applied to the technique's standard deviation
    pub interval_scale: f64,
    pub confidence_scale: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            interval_scale: 1.0,
            confidence_scale: DEFAULT_CONFIDENCE_SCALE,
        }
    }
}

/// A forecasting technique: a deterministic function of (features, artifact)
pub trait PricePredictor: Send + Sync {
    fn kind(&self) -> ModelKind;

    /// Point estimate and standard deviation for the target of `view`
    fn estimate(&self, view: &FeatureView<'_>, parameters: &ArtifactParameters) -> Result<Estimate>;

    /// Forecast the target date of `features` with the parameters of `artifact`
    fn predict(&self, features: &FeatureVector, artifact: &ModelArtifact) -> Result<ForecastResult> {
        if artifact.kind != self.kind() || artifact.parameters.kind() != self.kind() {
            return Err(EngineError::SchemaMismatch {
                expected: format!("{} artifact", self.kind()),
                found: format!("{} artifact {}", artifact.kind, artifact.version_id),
            });
        }
        let schema = artifact.schema.as_ref().ok_or_else(|| EngineError::SchemaMismatch {
            expected: "artifact with feature schema".to_string(),
            found: format!("{} without schema", artifact.version_id),
        })?;
        let view = schema.view(features)?;
        let estimate = self.estimate(&view, &artifact.parameters)?;
        let calibration = calibration_of(&artifact.parameters);
        let bounded = bound(&view, estimate, calibration)?;

        Ok(ForecastResult {
            predicted_price: bounded.price,
            confidence_score: bounded.confidence,
            model_version: artifact.version_id.clone(),
            target_date: features.target_date,
            lower_bound: bounded.lower,
            upper_bound: bounded.upper,
        })
    }
}

/// Technique implementing `kind`; `None` for non-price kinds
pub fn predictor_for(kind: ModelKind) -> Option<Box<dyn PricePredictor>> {
    match kind {
        ModelKind::PriceTrend => Some(Box::new(TrendPredictor)),
        ModelKind::PriceSmoothing => Some(Box::new(SmoothingPredictor)),
        ModelKind::PriceEnsemble => Some(Box::new(EnsemblePredictor)),
        ModelKind::CropRecommendation => None,
    }
}

pub(crate) fn calibration_of(parameters: &ArtifactParameters) -> &Calibration {
    static DEFAULT: Calibration = Calibration {
        interval_scale: 1.0,
        confidence_scale: DEFAULT_CONFIDENCE_SCALE,
    };
    match parameters {
        ArtifactParameters::Trend(p) => &p.calibration,
        ArtifactParameters::Smoothing(p) => &p.calibration,
        ArtifactParameters::Ensemble(p) => &p.calibration,
        ArtifactParameters::Recommendation(_) => &DEFAULT,
    }
}

/// Calibrated forecast with interval and confidence
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct BoundedForecast {
    pub price: f64,
    pub lower: f64,
    pub upper: f64,
    pub confidence: f64,
}

pub(crate) fn bound(view: &FeatureView<'_>, estimate: Estimate, calibration: &Calibration) -> Result<BoundedForecast> {
    if !estimate.price.is_finite() || !estimate.std_dev.is_finite() {
        return Err(EngineError::invalid("forecast is not finite for these features"));
    }
    let last_price = view.get("last_price")?;
    let price = estimate.price.max(last_price * PRICE_FLOOR_RATIO).max(f64::MIN_POSITIVE);
    let half_width = INTERVAL_Z * estimate.std_dev.max(0.0) * calibration.interval_scale.max(0.0);

    Ok(BoundedForecast {
        price,
        lower: (price - half_width).max(0.0),
        upper: price + half_width,
        confidence: confidence_from_interval(last_price, half_width, calibration.confidence_scale),
    })
}

/// Map an interval half-width, relative to the current market price, to a
/// confidence in [0, 1]
pub fn confidence_from_interval(reference_price: f64, half_width: f64, scale: f64) -> f64 {
    if reference_price <= 0.0 || scale <= 0.0 {
        return 0.0;
    }
    let relative = half_width / reference_price;
    (-relative / scale).exp().clamp(0.0, 1.0)
}

/// Floor on the one-step standard deviation so a flat series never reports certainty
pub(crate) fn noise_floor(last_price: f64) -> f64 {
    last_price.abs() * 0.005
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::features::{FeatureBuilder, FeatureConfig};

    #[test]
    fn test_confidence_bounds() {
        assert_eq!(confidence_from_interval(100.0, 0.0, 0.25), 1.0);
        assert!(confidence_from_interval(100.0, 1_000.0, 0.25) < 1e-3);
        assert_eq!(confidence_from_interval(0.0, 1.0, 0.25), 0.0);
        let narrow = confidence_from_interval(100.0, 2.0, 0.25);
        let wide = confidence_from_interval(100.0, 20.0, 0.25);
        assert!(narrow > wide);
    }

    #[test]
    fn test_predictor_for_kinds() {
        for kind in ModelKind::ALL {
            match predictor_for(kind) {
                Some(p) => assert_eq!(p.kind(), kind),
                None => assert_eq!(kind, ModelKind::CropRecommendation),
            }
        }
    }

    #[test]
    fn test_wrong_artifact_kind_rejected() {
        let (builder, vector) = features_for(7);
        let artifact = artifact(&builder, ArtifactParameters::Smoothing(SmoothingParams::default()));
        let err = TrendPredictor.predict(&vector, &artifact).unwrap_err();
        assert!(matches!(err, EngineError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_schema_skew_rejected() {
        let (_, vector) = features_for(7);
        let other = FeatureBuilder::new(FeatureConfig {
            windows: vec![7, 30],
            ..Default::default()
        });
        let artifact = artifact(&other, ArtifactParameters::Trend(TrendParams::default()));
        let err = TrendPredictor.predict(&vector, &artifact).unwrap_err();
        assert!(matches!(err, EngineError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_confidence_tracks_horizon() {
        let (builder, near) = features_for(3);
        let (_, far) = features_for(120);
        let artifact = artifact(&builder, ArtifactParameters::Trend(TrendParams::default()));
        let near = TrendPredictor.predict(&near, &artifact).unwrap();
        let far = TrendPredictor.predict(&far, &artifact).unwrap();
        assert!(near.confidence_score > far.confidence_score);
        assert!(far.upper_bound - far.lower_bound > near.upper_bound - near.lower_bound);
    }
}
