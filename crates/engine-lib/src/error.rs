//! Error taxonomy for the engine
//!
//! Every failure a caller can observe maps to exactly one variant, so the
//! routing layer can translate each kind into a distinct response.

use crate::models::ModelKind;
use thiserror::Error;

/// Result type used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No price history for crop '{crop_id}' in district '{district}'")]
    NotFound { crop_id: String, district: String },

    #[error("Insufficient data: {found} observations, need at least {required}")]
    InsufficientData { required: usize, found: usize },

    #[error("Feature schema mismatch: model expects {expected}, got {found}")]
    SchemaMismatch { expected: String, found: String },

    #[error("No trained model available for {0}")]
    NoModelAvailable(ModelKind),

    #[error("Training failed: {0}")]
    Training(String),

    #[error("Price store unavailable after {attempts} attempts: {reason}")]
    StoreUnavailable { attempts: u32, reason: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Artifact persistence failed: {0}")]
    Persistence(String),
}

impl EngineError {
    /// Stable machine-readable code for the error kind
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidArgument(_) => "invalid_argument",
            EngineError::NotFound { .. } => "not_found",
            EngineError::InsufficientData { .. } => "insufficient_data",
            EngineError::SchemaMismatch { .. } => "schema_mismatch",
            EngineError::NoModelAvailable(_) => "no_model_available",
            EngineError::Training(_) => "training_failed",
            EngineError::StoreUnavailable { .. } => "store_unavailable",
            EngineError::Cancelled => "cancelled",
            EngineError::Persistence(_) => "persistence_failed",
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        EngineError::InvalidArgument(message.into())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}
