//! Core data models for the crop market engine

use crate::error::EngineError;
use crate::features::FeatureSchema;
use crate::predictor::{EnsembleParams, SmoothingParams, TrendParams};
use crate::recommender::RecommendationParams;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Market grade of a recorded price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceQuality {
    A,
    B,
    C,
}

impl SourceQuality {
    /// Weight applied when several observations fall on the same day
    pub fn weight(&self) -> f64 {
        match self {
            SourceQuality::A => 1.0,
            SourceQuality::B => 0.8,
            SourceQuality::C => 0.6,
        }
    }
}

/// A single recorded market price for a crop in a district
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub crop_id: String,
    pub district: String,
    pub timestamp: DateTime<Utc>,
    /// Price per kg, always positive
    pub price: f64,
    pub source_quality: SourceQuality,
    /// When the store ingested the record; the latest wins on duplicate timestamps
    pub recorded_at: DateTime<Utc>,
}

impl PriceObservation {
    pub fn new(
        crop_id: impl Into<String>,
        district: impl Into<String>,
        timestamp: DateTime<Utc>,
        price: f64,
    ) -> Self {
        Self {
            crop_id: crop_id.into(),
            district: district.into(),
            timestamp,
            price,
            source_quality: SourceQuality::A,
            recorded_at: timestamp,
        }
    }

    pub fn with_quality(mut self, quality: SourceQuality) -> Self {
        self.source_quality = quality;
        self
    }

    pub fn recorded(mut self, recorded_at: DateTime<Utc>) -> Self {
        self.recorded_at = recorded_at;
        self
    }

    pub fn day(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

/// Model-ready features derived from a price series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub crop_id: String,
    pub district: String,
    /// Timestamp of the most recent observation the features were built from
    pub timestamp: DateTime<Utc>,
    pub target_date: NaiveDate,
    pub numeric: Vec<f64>,
    pub categorical: Vec<u32>,
    pub schema_fingerprint: String,
}

/// Point forecast with its uncertainty
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub predicted_price: f64,
    pub confidence_score: f64,
    pub model_version: String,
    pub target_date: NaiveDate,
    /// Lower end of the 95% prediction interval
    pub lower_bound: f64,
    /// Upper end of the 95% prediction interval
    pub upper_bound: f64,
}

/// Named signal that contributed to a recommendation score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RationaleFeature {
    pub name: String,
    pub value: f64,
}

impl RationaleFeature {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// One ranked crop recommendation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationEntry {
    pub crop_id: String,
    pub crop_name: String,
    pub score: f64,
    pub rationale_features: Vec<RationaleFeature>,
}

/// Kind of model held by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    /// Linear trend regression
    PriceTrend,
    /// Damped-trend exponential smoothing
    PriceSmoothing,
    /// Weighted combination of trend and smoothing
    PriceEnsemble,
    CropRecommendation,
}

impl ModelKind {
    pub const ALL: [ModelKind; 4] = [
        ModelKind::PriceTrend,
        ModelKind::PriceSmoothing,
        ModelKind::PriceEnsemble,
        ModelKind::CropRecommendation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::PriceTrend => "price-trend",
            ModelKind::PriceSmoothing => "price-smoothing",
            ModelKind::PriceEnsemble => "price-ensemble",
            ModelKind::CropRecommendation => "crop-recommendation",
        }
    }

    pub fn is_price(&self) -> bool {
        !matches!(self, ModelKind::CropRecommendation)
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| EngineError::invalid(format!("unknown model kind '{}'", s)))
    }
}

/// Coarse agricultural season used to contextualize recommendations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Season {
    /// Monsoon season, June to September
    Kharif,
    /// Winter season, October to January
    Rabi,
    /// Summer season, February to May
    Zaid,
}

impl Season {
    pub const ALL: [Season; 3] = [Season::Kharif, Season::Rabi, Season::Zaid];

    pub fn from_month(month: u32) -> Self {
        match month {
            6..=9 => Season::Kharif,
            10..=12 | 1 => Season::Rabi,
            _ => Season::Zaid,
        }
    }

    pub fn for_date(date: NaiveDate) -> Self {
        Self::from_month(date.month())
    }

    pub fn current() -> Self {
        Self::for_date(Utc::now().date_naive())
    }

    pub fn months(&self) -> &'static [u32] {
        match self {
            Season::Kharif => &[6, 7, 8, 9],
            Season::Rabi => &[10, 11, 12, 1],
            Season::Zaid => &[2, 3, 4, 5],
        }
    }

    pub fn contains_month(&self, month: u32) -> bool {
        self.months().contains(&month)
    }

    /// Categorical code used by the feature encoding
    pub fn code(&self) -> u32 {
        match self {
            Season::Kharif => 0,
            Season::Rabi => 1,
            Season::Zaid => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Season::Kharif => "kharif",
            Season::Rabi => "rabi",
            Season::Zaid => "zaid",
        }
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Season {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kharif" | "monsoon" => Ok(Season::Kharif),
            "rabi" | "winter" => Ok(Season::Rabi),
            "zaid" | "summer" => Ok(Season::Zaid),
            other => Err(EngineError::invalid(format!("unknown season '{}'", other))),
        }
    }
}

/// Kind of grower asking for recommendations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    /// Risk-averse smallholder
    Farmer,
    /// Yield-weighted commercial grower
    Commercial,
    Buyer,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Farmer => "farmer",
            UserType::Commercial => "commercial",
            UserType::Buyer => "buyer",
        }
    }
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "farmer" | "smallholder" => Ok(UserType::Farmer),
            "commercial" => Ok(UserType::Commercial),
            "buyer" => Ok(UserType::Buyer),
            other => Err(EngineError::invalid(format!("unknown user type '{}'", other))),
        }
    }
}

/// Time restriction applied to a history query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryWindow {
    /// The last `n` days, ending now
    Days(u32),
    /// Inclusive explicit span
    Span {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl HistoryWindow {
    pub fn resolve(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        match *self {
            HistoryWindow::Days(days) => (now - Duration::days(days as i64), now),
            HistoryWindow::Span { start, end } => (start, end),
        }
    }
}

/// Backtest metrics recorded for a trained artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetrics {
    /// Error compared by the acceptance rule (lower is better)
    pub primary_error: f64,
    /// Mean absolute percentage error, price models only
    pub mape: Option<f64>,
    pub rmse: Option<f64>,
    /// Share of holdout targets inside the 95% interval
    pub interval_coverage: Option<f64>,
    pub samples: usize,
}

impl ValidationMetrics {
    pub fn is_finite(&self) -> bool {
        self.primary_error.is_finite()
            && self.mape.map_or(true, f64::is_finite)
            && self.rmse.map_or(true, f64::is_finite)
    }
}

/// Corpus a candidate was trained on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub series_used: usize,
    pub training_samples: usize,
}

/// Trained parameters, one variant per model kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "technique", rename_all = "snake_case")]
pub enum ArtifactParameters {
    Trend(TrendParams),
    Smoothing(SmoothingParams),
    Ensemble(EnsembleParams),
    Recommendation(RecommendationParams),
}

impl ArtifactParameters {
    pub fn kind(&self) -> ModelKind {
        match self {
            ArtifactParameters::Trend(_) => ModelKind::PriceTrend,
            ArtifactParameters::Smoothing(_) => ModelKind::PriceSmoothing,
            ArtifactParameters::Ensemble(_) => ModelKind::PriceEnsemble,
            ArtifactParameters::Recommendation(_) => ModelKind::CropRecommendation,
        }
    }
}

/// Versioned trained model, immutable once built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub version_id: String,
    pub kind: ModelKind,
    pub trained_at: DateTime<Utc>,
    pub parameters: ArtifactParameters,
    pub validation_metrics: ValidationMetrics,
    /// Feature layout the parameters were fitted against (price models)
    pub schema: Option<FeatureSchema>,
    pub training: TrainingSummary,
}
