//! Crop recommendation
//!
//! Ranks the catalog crops suitable for a season by a weighted mean of a
//! return signal, a stability signal and the artifact's learned affinity.
//! Crops without enough history in the district are left out of the ranking
//! entirely rather than scored as zero.

mod scoring;

pub use scoring::{CandidateSignals, RecommendationParams, ScoringPolicy, ScoringWeights};

use crate::catalog::CropCatalog;
use crate::error::{EngineError, Result};
use crate::history::HistoryRepository;
use crate::models::{
    ArtifactParameters, HistoryWindow, ModelArtifact, ModelKind, RationaleFeature, RecommendationEntry,
    Season, UserType,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecommenderConfig {
    /// Maximum number of entries returned
    pub top_k: usize,
    /// Days of history used per candidate
    pub history_days: u32,
}

impl Default for RecommenderConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            history_days: 365,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecommendationRequest {
    pub district: String,
    pub season: Season,
    pub user_type: UserType,
    /// End of the history window
    pub as_of: DateTime<Utc>,
}

/// Ranked entries plus the candidates left out for lack of data
#[derive(Debug, Clone, PartialEq)]
pub struct Recommendations {
    pub entries: Vec<RecommendationEntry>,
    pub excluded: Vec<String>,
    pub model_version: String,
}

pub struct CropRecommender {
    repository: Arc<HistoryRepository>,
    catalog: Arc<CropCatalog>,
    config: RecommenderConfig,
    min_observations: usize,
}

impl CropRecommender {
    pub fn new(
        repository: Arc<HistoryRepository>,
        catalog: Arc<CropCatalog>,
        config: RecommenderConfig,
        min_observations: usize,
    ) -> Self {
        Self {
            repository,
            catalog,
            config,
            min_observations,
        }
    }

    pub async fn recommend(
        &self,
        request: &RecommendationRequest,
        artifact: &ModelArtifact,
        cancel: &CancellationToken,
    ) -> Result<Recommendations> {
        let district = request.district.trim();
        if district.is_empty() {
            return Err(EngineError::invalid("district must not be empty"));
        }
        let params = match &artifact.parameters {
            ArtifactParameters::Recommendation(params) => params,
            other => {
                return Err(EngineError::SchemaMismatch {
                    expected: ModelKind::CropRecommendation.to_string(),
                    found: other.kind().to_string(),
                })
            }
        };
        let weights = params.policy.weights_for(request.user_type);
        let window = HistoryWindow::Span {
            start: request.as_of - Duration::days(self.config.history_days as i64),
            end: request.as_of,
        };

        let mut entries = Vec::new();
        let mut excluded = Vec::new();

        for crop in self.catalog.for_season(request.season) {
            let history = match self
                .repository
                .get_history(&crop.crop_id, district, window, cancel)
                .await
            {
                Ok(history) => history,
                Err(EngineError::NotFound { .. }) => {
                    excluded.push(crop.crop_id.clone());
                    continue;
                }
                Err(e) => return Err(e),
            };
            if history.len() < self.min_observations {
                debug!(
                    crop_id = %crop.crop_id,
                    district = %district,
                    observations = history.len(),
                    "Excluding crop with too little history"
                );
                excluded.push(crop.crop_id.clone());
                continue;
            }
            let Some(signals) = CandidateSignals::from_history(&history, request.season) else {
                excluded.push(crop.crop_id.clone());
                continue;
            };

            let typical = crop.is_typical_for(district);
            let district_fit = if typical { 1.0 } else { params.off_district_factor.clamp(0.0, 1.0) };
            let affinity = params.affinity(district, request.season, &crop.crop_id) * district_fit;
            let return_signal = signals.return_signal();
            let stability = signals.stability_signal();

            entries.push(RecommendationEntry {
                crop_id: crop.crop_id.clone(),
                crop_name: crop.name.clone(),
                score: weights.combine(return_signal, stability, affinity),
                rationale_features: vec![
                    RationaleFeature::new("price_trend", signals.relative_trend),
                    RationaleFeature::new("volatility", signals.coefficient_of_variation),
                    RationaleFeature::new("seasonal_margin", signals.seasonal_margin),
                    RationaleFeature::new("return_signal", return_signal),
                    RationaleFeature::new("stability_signal", stability),
                    RationaleFeature::new("affinity", affinity),
                    RationaleFeature::new("district_fit", if typical { 1.0 } else { 0.0 }),
                    RationaleFeature::new("observations", signals.observations as f64),
                ],
            });
        }

        rank(&mut entries);
        entries.truncate(self.config.top_k);

        Ok(Recommendations {
            entries,
            excluded,
            model_version: artifact.version_id.clone(),
        })
    }
}

/// Score descending, then crop id ascending
fn rank(entries: &mut [RecommendationEntry]) {
    entries.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.crop_id.cmp(&b.crop_id))
    });
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::models::{PriceObservation, Season};
    use chrono::{Datelike, Duration, TimeZone, Utc};

    /// One year of daily prices in 2024: `base`, or `peak` during kharif,
    /// with an alternating `swing` on top
    pub fn seasonal_year(crop: &str, district: &str, base: f64, peak: f64, swing: f64) -> Vec<PriceObservation> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap();
        (0..365)
            .map(|d| {
                let ts = start + Duration::days(d);
                let level = if Season::Kharif.contains_month(ts.month()) { peak } else { base };
                let noise = if d % 2 == 0 { swing } else { -swing };
                PriceObservation::new(crop, district, ts, level + noise)
            })
            .collect()
    }
}
