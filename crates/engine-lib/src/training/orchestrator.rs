//! Training orchestration
//!
//! `Idle -> Training -> Validating -> {Promoted | Rejected} -> Idle`, one run
//! in flight per model kind. Runs are spawned onto the runtime so they finish
//! even when the caller stops awaiting.

use super::fitting::{self, FittedCandidate};
use super::{accept, TrainingConfig};
use crate::catalog::CropCatalog;
use crate::error::{EngineError, Result};
use crate::features::FeatureBuilder;
use crate::history::HistoryRepository;
use crate::models::{HistoryWindow, ModelArtifact, ModelKind, PriceObservation, TrainingSummary, ValidationMetrics};
use crate::observability::{EngineMetrics, EventLogger};
use crate::registry::ModelRegistry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingPhase {
    Idle,
    Training,
    Validating,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TrainingDecision {
    Promoted,
    Rejected { reason: String },
}

/// Result of one retraining run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingReport {
    pub kind: ModelKind,
    pub candidate_version: String,
    pub decision: TrainingDecision,
    pub candidate_metrics: ValidationMetrics,
    /// Active version when validation ran
    pub previous_version: Option<String>,
    pub previous_metrics: Option<ValidationMetrics>,
    pub series_used: usize,
    pub training_samples: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TrainingReport {
    pub fn promoted(&self) -> bool {
        self.decision == TrainingDecision::Promoted
    }
}

struct Inner {
    repository: Arc<HistoryRepository>,
    catalog: Arc<CropCatalog>,
    registry: Arc<ModelRegistry>,
    builder: FeatureBuilder,
    config: TrainingConfig,
    locks: DashMap<ModelKind, Arc<Mutex<()>>>,
    phases: DashMap<ModelKind, TrainingPhase>,
    reports: DashMap<ModelKind, TrainingReport>,
    metrics: EngineMetrics,
    logger: EventLogger,
}

/// Resets the phase of a kind to `Idle` however the run ends
struct PhaseGuard<'a> {
    phases: &'a DashMap<ModelKind, TrainingPhase>,
    kind: ModelKind,
}

impl<'a> PhaseGuard<'a> {
    fn enter(phases: &'a DashMap<ModelKind, TrainingPhase>, kind: ModelKind) -> Self {
        phases.insert(kind, TrainingPhase::Training);
        Self { phases, kind }
    }

    fn set(&self, phase: TrainingPhase) {
        self.phases.insert(self.kind, phase);
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.phases.insert(self.kind, TrainingPhase::Idle);
    }
}

#[derive(Clone)]
pub struct TrainingOrchestrator {
    inner: Arc<Inner>,
}

impl TrainingOrchestrator {
    pub fn new(
        repository: Arc<HistoryRepository>,
        catalog: Arc<CropCatalog>,
        registry: Arc<ModelRegistry>,
        builder: FeatureBuilder,
        config: TrainingConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                repository,
                catalog,
                registry,
                builder,
                config,
                locks: DashMap::new(),
                phases: DashMap::new(),
                reports: DashMap::new(),
                metrics: EngineMetrics::new(),
                logger: EventLogger::new("crop-engine"),
            }),
        }
    }

    /// Retrain `kind`; a rejected candidate is a successful run
    pub async fn retrain(&self, kind: ModelKind) -> Result<TrainingReport> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run(kind).await })
            .await
            .map_err(|e| EngineError::Training(format!("training task failed: {}", e)))?
    }

    /// Retrain each kind in `kinds` concurrently
    pub async fn retrain_all(&self, kinds: &[ModelKind]) -> Vec<(ModelKind, Result<TrainingReport>)> {
        let handles: Vec<_> = kinds
            .iter()
            .map(|kind| {
                let this = self.clone();
                let kind = *kind;
                (kind, tokio::spawn(async move { this.retrain(kind).await }))
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (kind, handle) in handles {
            let result = handle
                .await
                .unwrap_or_else(|e| Err(EngineError::Training(format!("training task failed: {}", e))));
            results.push((kind, result));
        }
        results
    }

    pub fn state(&self, kind: ModelKind) -> TrainingPhase {
        self.inner
            .phases
            .get(&kind)
            .map(|p| *p)
            .unwrap_or(TrainingPhase::Idle)
    }

    pub fn last_report(&self, kind: ModelKind) -> Option<TrainingReport> {
        self.inner.reports.get(&kind).map(|r| r.clone())
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.inner.config
    }
}

impl Inner {
    fn lock_for(&self, kind: ModelKind) -> Arc<Mutex<()>> {
        self.locks
            .entry(kind)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn run(self: Arc<Self>, kind: ModelKind) -> Result<TrainingReport> {
        let lock = self.lock_for(kind);
        let _serialized = lock.lock().await;
        let phase = PhaseGuard::enter(&self.phases, kind);
        let started_at = Utc::now();
        let timer = Instant::now();
        info!(kind = %kind, "Training started");

        let corpus = self.load_corpus().await?;
        let series_used = corpus.len();
        if series_used == 0 {
            return Err(EngineError::Training("no price history available for training".to_string()));
        }

        let fitted = {
            let this = self.clone();
            tokio::task::spawn_blocking(move || this.fit(kind, &corpus))
                .await
                .map_err(|e| EngineError::Training(format!("fit worker failed: {}", e)))??
        };
        self.metrics
            .observe_training(kind, timer.elapsed().as_secs_f64());

        phase.set(TrainingPhase::Validating);
        let active = self.registry.get_active(kind).await.ok();
        let candidate = ModelArtifact {
            version_id: self.registry.next_version_id(kind),
            kind,
            trained_at: Utc::now(),
            parameters: fitted.parameters,
            validation_metrics: fitted.metrics,
            schema: kind.is_price().then(|| self.builder.schema().clone()),
            training: TrainingSummary {
                series_used,
                training_samples: fitted.training_samples,
            },
        };

        let verdict = accept(
            &candidate.validation_metrics,
            active.as_ref().map(|a| &a.validation_metrics),
            &self.config,
        );
        let decision = match verdict {
            Ok(()) => {
                let primary_error = candidate.validation_metrics.primary_error;
                let version = candidate.version_id.clone();
                self.registry.promote(candidate.clone()).await?;
                let pruned = self.registry.prune(kind, self.config.retained_versions).await;
                if pruned > 0 {
                    debug!(kind = %kind, pruned, "Pruned retired model versions");
                }
                self.logger.log_promotion(
                    kind,
                    active.as_ref().map(|a| a.version_id.as_str()),
                    &version,
                    primary_error,
                );
                TrainingDecision::Promoted
            }
            Err(reason) => {
                self.metrics.inc_rejections(kind);
                self.logger.log_rejection(kind, &candidate.version_id, &reason);
                TrainingDecision::Rejected { reason }
            }
        };

        let report = TrainingReport {
            kind,
            candidate_version: candidate.version_id,
            decision,
            candidate_metrics: candidate.validation_metrics,
            previous_version: active.as_ref().map(|a| a.version_id.clone()),
            previous_metrics: active.as_ref().map(|a| a.validation_metrics.clone()),
            series_used,
            training_samples: candidate.training.training_samples,
            started_at,
            finished_at: Utc::now(),
        };
        self.reports.insert(kind, report.clone());
        Ok(report)
    }

    /// History of every corpus series that has any; missing series are skipped.
    ///
    /// Any other fetch failure aborts the run so a candidate is never fitted
    /// and validated on a partial corpus.
    async fn load_corpus(&self) -> Result<Vec<Vec<PriceObservation>>> {
        // Training runs to completion once started
        let cancel = CancellationToken::new();
        let window = HistoryWindow::Days(self.config.corpus_days);
        let mut corpus = Vec::new();

        for (crop_id, district) in self.catalog.series_keys(&self.config.extra_districts) {
            match self
                .repository
                .get_history(&crop_id, &district, window, &cancel)
                .await
            {
                Ok(history) => corpus.push(history),
                Err(EngineError::NotFound { .. }) => {
                    debug!(crop_id = %crop_id, district = %district, "No history for corpus series");
                }
                Err(e) => {
                    warn!(crop_id = %crop_id, district = %district, error = %e, "Corpus fetch failed, aborting training");
                    return Err(EngineError::Training(format!(
                        "history for {} in {} unavailable: {}",
                        crop_id, district, e
                    )));
                }
            }
        }
        Ok(corpus)
    }

    fn fit(&self, kind: ModelKind, corpus: &[Vec<PriceObservation>]) -> Result<FittedCandidate> {
        if kind == ModelKind::CropRecommendation {
            return fitting::fit_recommendation_model(&self.catalog, corpus, &self.config);
        }
        let samples = corpus
            .iter()
            .flat_map(|history| fitting::series_samples(&self.builder, history, &self.config))
            .collect();
        let split = fitting::split_samples(samples, self.config.holdout_fraction);
        fitting::fit_price_model(kind, &self.builder, &split, &self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureConfig;
    use crate::history::{InMemoryPriceStore, PriceStore, RetryConfig, StoreError};
    use crate::models::ArtifactParameters;
    use crate::predictor::TrendParams;
    use async_trait::async_trait;
    use chrono::Duration;

    /// Store whose queries for one district always fail
    struct DistrictOutage {
        inner: InMemoryPriceStore,
        down: &'static str,
    }

    #[async_trait]
    impl PriceStore for DistrictOutage {
        async fn query(
            &self,
            crop_id: &str,
            district: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> std::result::Result<Vec<PriceObservation>, StoreError> {
            if district == self.down {
                return Err(StoreError::Unavailable(format!("{} replica offline", district)));
            }
            self.inner.query(crop_id, district, start, end).await
        }

        async fn query_filtered(
            &self,
            crop_id: Option<&str>,
            district: Option<&str>,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> std::result::Result<Vec<PriceObservation>, StoreError> {
            self.inner.query_filtered(crop_id, district, start, end).await
        }
    }

    /// 120 daily rice prices in Thanjavur ending yesterday
    fn store_with_rice() -> InMemoryPriceStore {
        let store = InMemoryPriceStore::new();
        let start = Utc::now() - Duration::days(120);
        store.extend((0..120).map(|d| {
            let wobble = if d % 2 == 0 { 0.2 } else { -0.2 };
            PriceObservation::new("rice", "Thanjavur", start + Duration::days(d), 20.0 + 0.1 * d as f64 + wobble)
        }));
        store
    }

    fn orchestrator(store: InMemoryPriceStore, registry: Arc<ModelRegistry>) -> TrainingOrchestrator {
        orchestrator_over(Arc::new(store), registry)
    }

    fn orchestrator_over(store: Arc<dyn PriceStore>, registry: Arc<ModelRegistry>) -> TrainingOrchestrator {
        let retry = RetryConfig {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        };
        TrainingOrchestrator::new(
            Arc::new(HistoryRepository::new(store, retry)),
            Arc::new(CropCatalog::tamil_nadu()),
            registry,
            FeatureBuilder::new(FeatureConfig::default()),
            TrainingConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_first_training_promotes() {
        let registry = Arc::new(ModelRegistry::new());
        let orchestrator = orchestrator(store_with_rice(), registry.clone());

        let report = orchestrator.retrain(ModelKind::PriceTrend).await.unwrap();
        assert!(report.promoted(), "{:?}", report.decision);
        assert_eq!(report.previous_version, None);
        assert_eq!(report.series_used, 1);

        let active = registry.get_active(ModelKind::PriceTrend).await.unwrap();
        assert_eq!(active.version_id, report.candidate_version);
        assert!(active.schema.is_some());
        assert_eq!(orchestrator.state(ModelKind::PriceTrend), TrainingPhase::Idle);
        assert_eq!(orchestrator.last_report(ModelKind::PriceTrend), Some(report));
    }

    #[tokio::test]
    async fn test_rejection_keeps_active() {
        let registry = Arc::new(ModelRegistry::new());
        let builder = FeatureBuilder::new(FeatureConfig::default());
        // An unbeatable active model: zero validation error
        let active = ModelArtifact {
            version_id: registry.next_version_id(ModelKind::PriceTrend),
            kind: ModelKind::PriceTrend,
            trained_at: Utc::now(),
            parameters: ArtifactParameters::Trend(TrendParams::default()),
            validation_metrics: ValidationMetrics {
                primary_error: 0.0,
                mape: Some(0.0),
                rmse: Some(0.0),
                interval_coverage: Some(1.0),
                samples: 50,
            },
            schema: Some(builder.schema().clone()),
            training: TrainingSummary {
                series_used: 1,
                training_samples: 100,
            },
        };
        registry.promote(active).await.unwrap();
        let before = registry.status_of(ModelKind::PriceTrend).await;

        let orchestrator = orchestrator(store_with_rice(), registry.clone());
        let report = orchestrator.retrain(ModelKind::PriceTrend).await.unwrap();
        assert!(matches!(report.decision, TrainingDecision::Rejected { .. }));

        let after = registry.status_of(ModelKind::PriceTrend).await;
        assert_eq!(after.active_version, before.active_version);
        assert_eq!(after.validation_metrics, before.validation_metrics);
        assert!(after.retained_versions.is_empty());
    }

    #[tokio::test]
    async fn test_empty_corpus_is_training_error() {
        let registry = Arc::new(ModelRegistry::new());
        let orchestrator = orchestrator(InMemoryPriceStore::new(), registry.clone());
        let err = orchestrator.retrain(ModelKind::PriceEnsemble).await.unwrap_err();
        assert!(matches!(err, EngineError::Training(_)));
        assert!(registry.get_active(ModelKind::PriceEnsemble).await.is_err());
        assert_eq!(orchestrator.state(ModelKind::PriceEnsemble), TrainingPhase::Idle);
    }

    #[tokio::test]
    async fn test_store_outage_aborts_training() {
        let store = store_with_rice();
        let start = Utc::now() - Duration::days(120);
        store.extend((0..120).map(|d| {
            PriceObservation::new("rice", "Madurai", start + Duration::days(d), 22.0 + 0.05 * d as f64)
        }));
        let registry = Arc::new(ModelRegistry::new());
        let orchestrator = orchestrator_over(
            Arc::new(DistrictOutage {
                inner: store,
                down: "Madurai",
            }),
            registry.clone(),
        );

        let err = orchestrator.retrain(ModelKind::PriceTrend).await.unwrap_err();
        assert!(matches!(err, EngineError::Training(ref reason) if reason.contains("Madurai")), "{err}");
        assert!(registry.get_active(ModelKind::PriceTrend).await.is_err());
        assert_eq!(orchestrator.last_report(ModelKind::PriceTrend), None);
        assert_eq!(orchestrator.state(ModelKind::PriceTrend), TrainingPhase::Idle);
    }

    #[tokio::test]
    async fn test_same_kind_runs_serialized() {
        let registry = Arc::new(ModelRegistry::new());
        let orchestrator = orchestrator(store_with_rice(), registry.clone());

        let results = orchestrator
            .retrain_all(&[ModelKind::PriceSmoothing, ModelKind::PriceSmoothing, ModelKind::CropRecommendation])
            .await;
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        // Serialized runs allocate distinct versions and the second compares against the first
        let reports: Vec<_> = results
            .iter()
            .filter(|(k, _)| *k == ModelKind::PriceSmoothing)
            .filter_map(|(_, r)| r.as_ref().ok())
            .collect();
        assert_ne!(reports[0].candidate_version, reports[1].candidate_version);
        assert!(reports.iter().any(|r| r.previous_version.is_some()));
        assert!(registry.get_active(ModelKind::CropRecommendation).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_caller_still_completes() {
        let registry = Arc::new(ModelRegistry::new());
        let orchestrator = orchestrator(store_with_rice(), registry.clone());

        let handle = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.retrain(ModelKind::PriceTrend).await })
        };
        tokio::task::yield_now().await;
        handle.abort();

        // The spawned run keeps going and eventually promotes
        for _ in 0..200 {
            if registry.get_active(ModelKind::PriceTrend).await.is_ok() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("training did not complete after the caller went away");
    }
}
