//! Observability infrastructure for the crop market engine
//!
//! Provides:
//! - Prometheus metrics (forecast and recommendation latency, training
//!   duration, store retries, promotions, active model versions)
//! - Structured JSON logging of engine events with tracing

use crate::models::ModelKind;
use prometheus::{
    register_gauge_vec, register_histogram, register_histogram_vec, register_int_counter,
    register_int_counter_vec, GaugeVec, Histogram, HistogramVec, IntCounter, IntCounterVec,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for request latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Histogram buckets for training runs (in seconds)
const TRAINING_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0];

/// Global metrics instance, `None` if registration failed
static GLOBAL_METRICS: OnceLock<Option<EngineMetricsInner>> = OnceLock::new();

struct EngineMetricsInner {
    forecast_latency_seconds: Histogram,
    recommendation_latency_seconds: Histogram,
    training_duration_seconds: HistogramVec,
    forecasts: IntCounter,
    recommendations: IntCounter,
    errors: IntCounterVec,
    store_retries: IntCounter,
    schema_mismatches: IntCounter,
    promotions: IntCounterVec,
    rejections: IntCounterVec,
    active_model_info: GaugeVec,
}

impl EngineMetricsInner {
    fn new() -> prometheus::Result<Self> {
        Ok(Self {
            forecast_latency_seconds: register_histogram!(
                "crop_engine_forecast_latency_seconds",
                "Time spent producing a price forecast",
                LATENCY_BUCKETS.to_vec()
            )?,
            recommendation_latency_seconds: register_histogram!(
                "crop_engine_recommendation_latency_seconds",
                "Time spent ranking crop recommendations",
                LATENCY_BUCKETS.to_vec()
            )?,
            training_duration_seconds: register_histogram_vec!(
                "crop_engine_training_duration_seconds",
                "Wall time of a training run per model kind",
                &["kind"],
                TRAINING_BUCKETS.to_vec()
            )?,
            forecasts: register_int_counter!(
                "crop_engine_forecasts_total",
                "Total number of price forecasts served"
            )?,
            recommendations: register_int_counter!(
                "crop_engine_recommendations_total",
                "Total number of recommendation lists served"
            )?,
            errors: register_int_counter_vec!(
                "crop_engine_errors_total",
                "Failed engine operations by operation and error code",
                &["operation", "code"]
            )?,
            store_retries: register_int_counter!(
                "crop_engine_store_retries_total",
                "Transient history store failures that were retried"
            )?,
            schema_mismatches: register_int_counter!(
                "crop_engine_schema_mismatches_total",
                "Features rejected by the active artifact's schema"
            )?,
            promotions: register_int_counter_vec!(
                "crop_engine_promotions_total",
                "Artifacts promoted to active",
                &["kind"]
            )?,
            rejections: register_int_counter_vec!(
                "crop_engine_rejections_total",
                "Training candidates rejected by validation",
                &["kind"]
            )?,
            active_model_info: register_gauge_vec!(
                "crop_engine_active_model_info",
                "Currently active artifact version per model kind",
                &["kind", "version"]
            )?,
        })
    }
}

/// Lightweight handle to the process-wide engine metrics
///
/// Clones share the same underlying metrics. If registration failed the
/// handle silently records nothing.
#[derive(Clone)]
pub struct EngineMetrics {
    _private: (),
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(|| match EngineMetricsInner::new() {
            Ok(inner) => Some(inner),
            Err(e) => {
                warn!(error = %e, "Failed to register engine metrics");
                None
            }
        });
        Self { _private: () }
    }

    fn inner(&self) -> Option<&EngineMetricsInner> {
        GLOBAL_METRICS.get().and_then(Option::as_ref)
    }

    pub fn observe_forecast(&self, duration_secs: f64) {
        if let Some(m) = self.inner() {
            m.forecast_latency_seconds.observe(duration_secs);
            m.forecasts.inc();
        }
    }

    pub fn observe_recommendation(&self, duration_secs: f64) {
        if let Some(m) = self.inner() {
            m.recommendation_latency_seconds.observe(duration_secs);
            m.recommendations.inc();
        }
    }

    pub fn observe_training(&self, kind: ModelKind, duration_secs: f64) {
        if let Some(m) = self.inner() {
            m.training_duration_seconds
                .with_label_values(&[kind.as_str()])
                .observe(duration_secs);
        }
    }

    /// Count a failed operation by its error code
    pub fn inc_error(&self, operation: &str, code: &str) {
        if let Some(m) = self.inner() {
            m.errors.with_label_values(&[operation, code]).inc();
        }
    }

    pub fn inc_store_retries(&self) {
        if let Some(m) = self.inner() {
            m.store_retries.inc();
        }
    }

    pub fn inc_schema_mismatches(&self) {
        if let Some(m) = self.inner() {
            m.schema_mismatches.inc();
        }
    }

    pub fn inc_rejections(&self, kind: ModelKind) {
        if let Some(m) = self.inner() {
            m.rejections.with_label_values(&[kind.as_str()]).inc();
        }
    }

    /// Record a promotion and move the version gauge for `kind`
    pub fn record_promotion(&self, kind: ModelKind, previous: Option<&str>, version: &str) {
        if let Some(m) = self.inner() {
            m.promotions.with_label_values(&[kind.as_str()]).inc();
            if let Some(old) = previous {
                let _ = m.active_model_info.remove_label_values(&[kind.as_str(), old]);
            }
            m.active_model_info
                .with_label_values(&[kind.as_str(), version])
                .set(1.0);
        }
    }
}

/// Structured logger for engine events
#[derive(Clone)]
pub struct EventLogger {
    service: String,
}

impl EventLogger {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn log_forecast(
        &self,
        crop_id: &str,
        district: &str,
        target_date: &str,
        predicted_price: f64,
        confidence: f64,
        model_version: &str,
    ) {
        info!(
            event = "forecast_generated",
            service = %self.service,
            crop_id = %crop_id,
            district = %district,
            target_date = %target_date,
            predicted_price = predicted_price,
            confidence = confidence,
            model_version = %model_version,
            "Generated price forecast"
        );
    }

    pub fn log_recommendation(
        &self,
        district: &str,
        season: &str,
        user_type: &str,
        returned: usize,
        excluded: usize,
        model_version: &str,
    ) {
        info!(
            event = "recommendation_generated",
            service = %self.service,
            district = %district,
            season = %season,
            user_type = %user_type,
            returned = returned,
            excluded = excluded,
            model_version = %model_version,
            "Generated crop recommendations"
        );
    }

    /// Log a candidate that replaced the active artifact
    pub fn log_promotion(&self, kind: ModelKind, previous: Option<&str>, version: &str, primary_error: f64) {
        info!(
            event = "model_promoted",
            service = %self.service,
            kind = %kind,
            previous_version = previous.unwrap_or("none"),
            new_version = %version,
            primary_error = primary_error,
            "Model artifact promoted"
        );
    }

    /// Log a candidate that failed validation; the active artifact stays
    pub fn log_rejection(&self, kind: ModelKind, version: &str, reason: &str) {
        warn!(
            event = "model_rejected",
            service = %self.service,
            kind = %kind,
            candidate_version = %version,
            reason = %reason,
            "Candidate rejected, keeping active model"
        );
    }

    /// Training/serving skew is a deployment bug, not a data problem
    pub fn log_schema_mismatch(&self, crop_id: &str, district: &str, model_version: &str, details: &str) {
        error!(
            event = "schema_mismatch",
            service = %self.service,
            crop_id = %crop_id,
            district = %district,
            model_version = %model_version,
            details = %details,
            "Feature schema does not match active artifact"
        );
    }

    pub fn log_startup(&self, version: &str, active_models: usize) {
        info!(
            event = "engine_started",
            service = %self.service,
            engine_version = %version,
            active_models = active_models,
            "Crop market engine started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "engine_shutdown",
            service = %self.service,
            reason = %reason,
            "Crop market engine shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_metrics_handles() {
        // Registration happens once per process; every handle shares it
        let metrics = EngineMetrics::new();
        let other = metrics.clone();

        metrics.observe_forecast(0.001);
        metrics.observe_recommendation(0.002);
        metrics.observe_training(ModelKind::PriceTrend, 0.5);
        metrics.inc_error("predict", "not_found");
        other.inc_store_retries();
        other.record_promotion(ModelKind::PriceTrend, None, "price-trend-v1");
        other.record_promotion(ModelKind::PriceTrend, Some("price-trend-v1"), "price-trend-v2");
        assert!(metrics.inner().is_some());
    }

    #[test]
    fn test_event_logger_creation() {
        let logger = EventLogger::new("crop-engine");
        assert_eq!(logger.service, "crop-engine");
        logger.log_rejection(ModelKind::PriceEnsemble, "price-ensemble-v2", "worse than active");
    }
}
