//! Engine library for crop price forecasting and crop recommendation
//!
//! This crate provides the core functionality for:
//! - Price history access with retries and cancellation
//! - Feature engineering over irregular price series
//! - Price forecasting with calibrated confidence
//! - Crop recommendation by season, district and grower type
//! - A versioned model registry and training orchestration
//! - Health checks and observability

pub mod analytics;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod features;
pub mod health;
pub mod history;
pub mod models;
pub mod observability;
pub mod predictor;
pub mod recommender;
pub mod registry;
pub mod training;

pub use catalog::{CropCatalog, CropProfile};
pub use config::EngineConfig;
pub use engine::{CropEngine, KindStatus};
pub use error::{EngineError, Result};
pub use health::{ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse};
pub use models::*;
pub use observability::{EngineMetrics, EventLogger};
