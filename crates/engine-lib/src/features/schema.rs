//! Feature layout shared between the builder and trained artifacts

use crate::error::{EngineError, Result};
use crate::models::FeatureVector;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Bumped whenever feature semantics change without a name change
pub const FEATURE_SCHEMA_VERSION: u32 = 1;

/// Ordered names of the numeric and categorical features plus encoding size
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub numeric: Vec<String>,
    pub categorical: Vec<String>,
    /// Bucket count of the identity encoding
    pub buckets: u32,
}

impl FeatureSchema {
    /// Layout produced for the given rolling windows
    pub fn for_windows(windows: &[u32], buckets: u32) -> Self {
        let mut numeric = vec!["last_price".to_string()];
        for window in windows {
            numeric.push(format!("mean_{}", window));
            numeric.push(format!("var_{}", window));
        }
        numeric.extend(
            [
                "trend_level",
                "trend_slope",
                "trend_residual_std",
                "trend_points",
                "trend_centroid_offset",
                "trend_sxx",
                "seasonal_adjustment",
                "season_phase_sin",
                "season_phase_cos",
                "horizon_days",
                "excluded_gap_days",
            ]
            .iter()
            .map(|s| s.to_string()),
        );

        Self {
            version: FEATURE_SCHEMA_VERSION,
            numeric,
            categorical: vec![
                "crop_code".to_string(),
                "district_code".to_string(),
                "season_code".to_string(),
            ],
            buckets,
        }
    }

    /// Short stable digest identifying the layout
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_be_bytes());
        for name in &self.numeric {
            hasher.update(b"n:");
            hasher.update(name.as_bytes());
        }
        for name in &self.categorical {
            hasher.update(b"c:");
            hasher.update(name.as_bytes());
        }
        hasher.update(self.buckets.to_be_bytes());
        hex::encode(&hasher.finalize()[..8])
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.numeric.iter().position(|n| n == name)
    }

    /// Rolling windows present in the layout, ascending
    pub fn windows(&self) -> Vec<u32> {
        let mut windows: Vec<u32> = self
            .numeric
            .iter()
            .filter_map(|n| n.strip_prefix("mean_"))
            .filter_map(|w| w.parse().ok())
            .collect();
        windows.sort_unstable();
        windows
    }

    fn describe(&self) -> String {
        format!(
            "{} numeric/{} categorical/{} buckets ({})",
            self.numeric.len(),
            self.categorical.len(),
            self.buckets,
            self.fingerprint()
        )
    }

    /// Check that `features` was produced with this layout
    pub fn view<'a>(&'a self, features: &'a FeatureVector) -> Result<FeatureView<'a>> {
        let fingerprint = self.fingerprint();
        let out_of_range = features.categorical.iter().any(|c| *c >= self.buckets);

        if features.numeric.len() != self.numeric.len()
            || features.categorical.len() != self.categorical.len()
            || features.schema_fingerprint != fingerprint
            || out_of_range
        {
            return Err(EngineError::SchemaMismatch {
                expected: self.describe(),
                found: format!(
                    "{} numeric/{} categorical ({})",
                    features.numeric.len(),
                    features.categorical.len(),
                    features.schema_fingerprint
                ),
            });
        }
        if features.numeric.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::invalid("feature vector contains non-finite values"));
        }
        Ok(FeatureView {
            schema: self,
            features,
        })
    }
}

/// Name-addressed read access to a validated feature vector
#[derive(Debug, Clone, Copy)]
pub struct FeatureView<'a> {
    schema: &'a FeatureSchema,
    features: &'a FeatureVector,
}

impl<'a> FeatureView<'a> {
    pub fn get(&self, name: &str) -> Result<f64> {
        self.schema
            .index_of(name)
            .map(|i| self.features.numeric[i])
            .ok_or_else(|| EngineError::SchemaMismatch {
                expected: format!("feature '{}'", name),
                found: self.schema.fingerprint(),
            })
    }

    pub fn features(&self) -> &'a FeatureVector {
        self.features
    }

    pub fn schema(&self) -> &'a FeatureSchema {
        self.schema
    }
}
