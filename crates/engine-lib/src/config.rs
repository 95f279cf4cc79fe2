//! Engine configuration
//!
//! Every field has a default so a partial file or an empty environment
//! still yields a working engine.

use crate::error::{EngineError, Result};
use crate::features::FeatureConfig;
use crate::history::RetryConfig;
use crate::models::ModelKind;
use crate::recommender::RecommenderConfig;
use crate::training::TrainingConfig;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub feature: FeatureConfig,
    pub retry: RetryConfig,
    pub recommender: RecommenderConfig,
    pub training: TrainingConfig,
    /// Price kind served by `predict`
    pub price_model: ModelKind,
    /// Days of history loaded per forecast
    pub forecast_lookback_days: u32,
    /// Where promoted artifacts are persisted; in-memory only when unset
    pub artifact_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            feature: FeatureConfig::default(),
            retry: RetryConfig::default(),
            recommender: RecommenderConfig::default(),
            training: TrainingConfig::default(),
            price_model: ModelKind::PriceEnsemble,
            forecast_lookback_days: 365,
            artifact_dir: None,
        }
    }
}

impl EngineConfig {
    /// Reject settings no engine could serve with
    pub fn validate(&self) -> Result<()> {
        if !self.price_model.is_price() {
            return Err(EngineError::invalid(format!(
                "price_model must be a price kind, got {}",
                self.price_model
            )));
        }
        if self.forecast_lookback_days == 0 {
            return Err(EngineError::invalid("forecast_lookback_days must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"price_model": "price-trend", "recommender": {"top_k": 3}, "training": {"tolerance": 0.1}}"#,
        )
        .unwrap();
        assert_eq!(config.price_model, ModelKind::PriceTrend);
        assert_eq!(config.recommender.top_k, 3);
        assert_eq!(config.recommender.history_days, 365);
        assert_eq!(config.training.tolerance, 0.1);
        assert_eq!(config.training.horizon_days, 7);
        assert_eq!(config.feature.windows, vec![7, 30, 90]);
        assert!(config.artifact_dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_recommendation_kind_is_not_a_price_model() {
        let config: EngineConfig = serde_json::from_str(r#"{"price_model": "crop-recommendation"}"#).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(ref m) if m.contains("crop-recommendation")));

        let config = EngineConfig {
            forecast_lookback_days: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
