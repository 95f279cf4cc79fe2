//! Linear trend extrapolation with a seasonal multiplier

use super::{noise_floor, Calibration, Estimate, PricePredictor};
use crate::error::{EngineError, Result};
use crate::features::FeatureView;
use crate::models::{ArtifactParameters, ModelKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendParams {
    /// Exponent applied to the seasonal adjustment; 0 disables it
    pub seasonal_weight: f64,
    pub calibration: Calibration,
}

impl Default for TrendParams {
    fn default() -> Self {
        Self {
            seasonal_weight: 1.0,
            calibration: Calibration::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrendPredictor;

impl TrendPredictor {
    pub(crate) fn estimate_with(view: &FeatureView<'_>, params: &TrendParams) -> Result<Estimate> {
        let last_price = view.get("last_price")?;
        let level = view.get("trend_level")?;
        let slope = view.get("trend_slope")?;
        let residual = view.get("trend_residual_std")?;
        let points = view.get("trend_points")?;
        let centroid_offset = view.get("trend_centroid_offset")?;
        let sxx = view.get("trend_sxx")?;
        let seasonal = view.get("seasonal_adjustment")?;
        let horizon = view.get("horizon_days")?;

        let multiplier = if seasonal > 0.0 {
            seasonal.powf(params.seasonal_weight)
        } else {
            1.0
        };
        let price = (level + slope * horizon) * multiplier;

        // Prediction interval of an OLS fit evaluated at x = horizon
        let base = residual.max(noise_floor(last_price));
        let leverage = if sxx > f64::EPSILON && points >= 2.0 {
            1.0 / points + (horizon + centroid_offset).powi(2) / sxx
        } else {
            1.0
        };

        Ok(Estimate {
            price,
            std_dev: base * (1.0 + leverage).sqrt() * multiplier,
        })
    }
}

impl PricePredictor for TrendPredictor {
    fn kind(&self) -> ModelKind {
        ModelKind::PriceTrend
    }

    fn estimate(&self, view: &FeatureView<'_>, parameters: &ArtifactParameters) -> Result<Estimate> {
        match parameters {
            ArtifactParameters::Trend(params) => Self::estimate_with(view, params),
            other => Err(EngineError::SchemaMismatch {
                expected: ModelKind::PriceTrend.to_string(),
                found: other.kind().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn test_extrapolates_trend() {
        let (builder, vector) = features_for(7);
        let artifact = artifact(
            &builder,
            ArtifactParameters::Trend(TrendParams {
                seasonal_weight: 0.0,
                ..Default::default()
            }),
        );
        let forecast = TrendPredictor.predict(&vector, &artifact).unwrap();
        // Underlying line is 20 + 0.1 * day; 2024-04-06 is day 96
        assert!((forecast.predicted_price - 29.6).abs() < 0.1, "{:?}", forecast);
        assert!(forecast.lower_bound < forecast.predicted_price);
        assert!(forecast.upper_bound > forecast.predicted_price);
        assert!(forecast.confidence_score > 0.9);
        assert_eq!(forecast.model_version, "price-trend-v1");
    }

    #[test]
    fn test_deterministic() {
        let (builder, vector) = features_for(14);
        let artifact = artifact(&builder, ArtifactParameters::Trend(TrendParams::default()));
        let a = TrendPredictor.predict(&vector, &artifact).unwrap();
        let b = TrendPredictor.predict(&vector, &artifact).unwrap();
        assert_eq!(a, b);
    }
}
