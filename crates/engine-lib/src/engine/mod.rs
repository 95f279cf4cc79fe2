//! Engine facade
//!
//! `CropEngine` wires the repository, feature builder, predictors,
//! recommender, registry and trainer together and is the only type the
//! service layer talks to. Every operation records latency and error
//! metrics and emits a structured event.

use crate::analytics::{self, MarketAnalytics};
use crate::catalog::CropCatalog;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::features::FeatureBuilder;
use crate::health::{components, HealthRegistry, HealthResponse, ReadinessResponse};
use crate::history::{HistoryRepository, PriceStore};
use crate::models::{ForecastResult, HistoryWindow, ModelKind, PriceObservation, Season, UserType};
use crate::observability::{EngineMetrics, EventLogger};
use crate::predictor::predictor_for;
use crate::recommender::{CropRecommender, RecommendationRequest, Recommendations};
use crate::registry::{ArtifactStore, ModelRegistry, ModelStatus};
use crate::training::{RetrainScheduler, Retrainer, TrainingOrchestrator, TrainingPhase, TrainingReport};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Registry status of a kind together with its training state
#[derive(Debug, Clone, Serialize)]
pub struct KindStatus {
    #[serde(flatten)]
    pub model: ModelStatus,
    pub phase: TrainingPhase,
    pub last_training: Option<TrainingReport>,
}

pub struct CropEngine {
    repository: Arc<HistoryRepository>,
    catalog: Arc<CropCatalog>,
    registry: Arc<ModelRegistry>,
    builder: FeatureBuilder,
    recommender: CropRecommender,
    orchestrator: TrainingOrchestrator,
    metrics: EngineMetrics,
    logger: EventLogger,
    health: HealthRegistry,
    store_degraded: AtomicBool,
    config: EngineConfig,
}

impl CropEngine {
    /// Wire the engine over `store`; fails on a configuration it cannot serve with
    pub fn new(store: Arc<dyn PriceStore>, catalog: CropCatalog, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let repository = Arc::new(HistoryRepository::new(store, config.retry.clone()));
        let catalog = Arc::new(catalog);
        let registry = Arc::new(match &config.artifact_dir {
            Some(dir) => ModelRegistry::with_store(ArtifactStore::new(dir.clone())),
            None => ModelRegistry::new(),
        });
        let builder = FeatureBuilder::new(config.feature.clone());
        let recommender = CropRecommender::new(
            repository.clone(),
            catalog.clone(),
            config.recommender.clone(),
            builder.min_observations(),
        );
        let orchestrator = TrainingOrchestrator::new(
            repository.clone(),
            catalog.clone(),
            registry.clone(),
            builder.clone(),
            config.training.clone(),
        );

        Ok(Self {
            repository,
            catalog,
            registry,
            builder,
            recommender,
            orchestrator,
            metrics: EngineMetrics::new(),
            logger: EventLogger::new("crop-engine"),
            health: HealthRegistry::new(),
            store_degraded: AtomicBool::new(false),
            config,
        })
    }

    /// Restore persisted artifacts and mark the engine ready
    pub async fn initialize(&self) -> Result<usize> {
        let restored = self.registry.restore().await?;
        self.health.set_healthy(components::HISTORY_STORE).await;
        self.health.set_healthy(components::TRAINER).await;
        self.refresh_model_health().await;
        self.health.set_ready(true);
        self.logger
            .log_startup(ENGINE_VERSION, self.registry.active_count().await);
        info!(restored, catalog_crops = self.catalog.len(), "Engine initialized");
        Ok(restored)
    }

    /// Forecast the price of `crop_id` in `district` on `target_date`
    pub async fn predict(
        &self,
        crop_id: &str,
        district: &str,
        target_date: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<ForecastResult> {
        let timer = Instant::now();
        let result = self.forecast(crop_id, district, target_date, cancel).await;
        match &result {
            Ok(forecast) => {
                self.metrics.observe_forecast(timer.elapsed().as_secs_f64());
                self.logger.log_forecast(
                    crop_id,
                    district,
                    &forecast.target_date.to_string(),
                    forecast.predicted_price,
                    forecast.confidence_score,
                    &forecast.model_version,
                );
            }
            Err(e) => self.record_failure("predict", e).await,
        }
        result
    }

    async fn forecast(
        &self,
        crop_id: &str,
        district: &str,
        target_date: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<ForecastResult> {
        let kind = self.config.price_model;
        // One snapshot per call; a concurrent promotion does not affect this request
        let artifact = self.registry.get_active(kind).await?;
        let predictor = predictor_for(kind).ok_or_else(|| EngineError::SchemaMismatch {
            expected: "price model kind".to_string(),
            found: kind.to_string(),
        })?;

        let history = self
            .repository
            .get_history(
                crop_id,
                district,
                HistoryWindow::Days(self.config.forecast_lookback_days),
                cancel,
            )
            .await?;
        self.store_recovered().await;

        let features = self.builder.build(&history, target_date)?;
        predictor.predict(&features, &artifact).map_err(|e| {
            if matches!(e, EngineError::SchemaMismatch { .. }) {
                self.metrics.inc_schema_mismatches();
                self.logger
                    .log_schema_mismatch(crop_id, district, &artifact.version_id, &e.to_string());
            }
            e
        })
    }

    /// Rank crops for `district`; the season defaults to the current one
    pub async fn recommend(
        &self,
        district: &str,
        season: Option<Season>,
        user_type: UserType,
        cancel: &CancellationToken,
    ) -> Result<Recommendations> {
        self.recommend_at(district, season.unwrap_or_else(Season::current), user_type, Utc::now(), cancel)
            .await
    }

    /// Rank crops using history up to `as_of`
    pub async fn recommend_at(
        &self,
        district: &str,
        season: Season,
        user_type: UserType,
        as_of: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Recommendations> {
        let timer = Instant::now();
        let result = async {
            let artifact = self.registry.get_active(ModelKind::CropRecommendation).await?;
            let request = RecommendationRequest {
                district: district.to_string(),
                season,
                user_type,
                as_of,
            };
            self.recommender.recommend(&request, &artifact, cancel).await
        }
        .await;

        match &result {
            Ok(recs) => {
                self.store_recovered().await;
                self.metrics.observe_recommendation(timer.elapsed().as_secs_f64());
                self.logger.log_recommendation(
                    district,
                    season.as_str(),
                    user_type.as_str(),
                    recs.entries.len(),
                    recs.excluded.len(),
                    &recs.model_version,
                );
            }
            Err(e) => self.record_failure("recommend", e).await,
        }
        result
    }

    /// Retrain `kind` now; a rejected candidate is still `Ok`
    pub async fn retrain(&self, kind: ModelKind) -> Result<TrainingReport> {
        let result = self.orchestrator.retrain(kind).await;
        self.after_training(&result).await;
        result
    }

    pub async fn retrain_all(&self, kinds: &[ModelKind]) -> Vec<(ModelKind, Result<TrainingReport>)> {
        let results = self.orchestrator.retrain_all(kinds).await;
        for (_, result) in &results {
            self.after_training(result).await;
        }
        results
    }

    async fn after_training(&self, result: &Result<TrainingReport>) {
        match result {
            Ok(_) => self.health.set_healthy(components::TRAINER).await,
            Err(e) => {
                self.metrics.inc_error("retrain", e.code());
                self.health
                    .set_degraded(components::TRAINER, format!("last training failed: {}", e))
                    .await;
            }
        }
        self.refresh_model_health().await;
    }

    /// Reactivate the previous version of `kind`
    pub async fn rollback(&self, kind: ModelKind) -> Result<ModelStatus> {
        self.registry.rollback(kind).await?;
        self.refresh_model_health().await;
        Ok(self.registry.status_of(kind).await)
    }

    pub async fn status_of(&self, kind: ModelKind) -> KindStatus {
        KindStatus {
            model: self.registry.status_of(kind).await,
            phase: self.orchestrator.state(kind),
            last_training: self.orchestrator.last_report(kind),
        }
    }

    pub async fn status(&self) -> Vec<KindStatus> {
        let mut status = Vec::with_capacity(ModelKind::ALL.len());
        for kind in ModelKind::ALL {
            status.push(self.status_of(kind).await);
        }
        status
    }

    /// Observations of the last `days` days, oldest first.
    ///
    /// Either filter may be `None`: no crop filter spans every crop, no
    /// district filter spans every district.
    pub async fn price_history(
        &self,
        crop_id: Option<&str>,
        district: Option<&str>,
        days: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<PriceObservation>> {
        let (start, end) = Self::window(days)?;
        self.market_history(crop_id, district, HistoryWindow::Span { start, end }, cancel)
            .await
    }

    /// Market statistics of the last `days` days with the observations behind them.
    ///
    /// A window without observations summarizes to zeros.
    pub async fn market_analytics(
        &self,
        crop_id: Option<&str>,
        district: Option<&str>,
        days: u32,
        cancel: &CancellationToken,
    ) -> Result<MarketAnalytics> {
        let (start, end) = Self::window(days)?;
        let observations = match self
            .market_history(crop_id, district, HistoryWindow::Span { start, end }, cancel)
            .await
        {
            Ok(observations) => observations,
            Err(EngineError::NotFound { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };
        Ok(MarketAnalytics {
            start,
            end,
            days,
            summary: analytics::summarize(&observations),
            observations,
        })
    }

    fn window(days: u32) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        if days == 0 {
            return Err(EngineError::invalid("days must be positive"));
        }
        Ok(HistoryWindow::Days(days).resolve(Utc::now()))
    }

    async fn market_history(
        &self,
        crop_id: Option<&str>,
        district: Option<&str>,
        window: HistoryWindow,
        cancel: &CancellationToken,
    ) -> Result<Vec<PriceObservation>> {
        let result = self
            .repository
            .get_market_history(crop_id, district, window, cancel)
            .await;
        match &result {
            Ok(_) => self.store_recovered().await,
            Err(e) => self.record_failure("price_history", e).await,
        }
        result
    }

    /// Background retraining loop over the configured kinds
    pub fn scheduler(self: &Arc<Self>, interval: Duration) -> RetrainScheduler {
        RetrainScheduler::new(
            self.clone(),
            interval,
            self.config.training.scheduled_kinds.clone(),
        )
    }

    /// Component health with model availability re-read from the registry
    pub async fn health_report(&self) -> HealthResponse {
        self.refresh_model_health().await;
        self.health.health().await
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        self.health.readiness().await
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &CropCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn shutdown(&self, reason: &str) {
        self.health.set_ready(false);
        self.logger.log_shutdown(reason);
    }

    async fn record_failure(&self, operation: &str, error: &EngineError) {
        self.metrics.inc_error(operation, error.code());
        if let EngineError::StoreUnavailable { .. } = error {
            self.store_degraded.store(true, Ordering::SeqCst);
            self.health
                .set_degraded(components::HISTORY_STORE, error.to_string())
                .await;
        }
    }

    async fn store_recovered(&self) {
        if self.store_degraded.swap(false, Ordering::SeqCst) {
            self.health.set_healthy(components::HISTORY_STORE).await;
        }
    }

    async fn refresh_model_health(&self) {
        let targets = [
            (components::PRICE_MODEL, self.config.price_model),
            (components::RECOMMENDATION_MODEL, ModelKind::CropRecommendation),
        ];
        for (component, kind) in targets {
            match self.registry.get_active(kind).await {
                Ok(_) => self.health.set_healthy(component).await,
                Err(_) => {
                    self.health
                        .set_degraded(component, format!("no trained {} model", kind))
                        .await
                }
            }
        }
    }
}

#[async_trait]
impl Retrainer for CropEngine {
    async fn retrain_all(&self, kinds: &[ModelKind]) -> Vec<(ModelKind, Result<TrainingReport>)> {
        CropEngine::retrain_all(self, kinds).await
    }
}
