//! Model registry
//!
//! Holds the active artifact per model kind behind an atomically swapped
//! `Arc` pointer. Readers load the pointer once per call without taking a
//! lock and keep serving from that snapshot, so a promotion never tears a
//! request in half and never makes a reader wait. Promotions are serialized
//! per kind and swap the pointer after the candidate has been fully built and
//! persisted. Retired versions live beside the pointers under a lock that
//! only writers and status queries touch.

mod persistence;

pub use persistence::{ArtifactStore, Manifest, StoredArtifacts};

use crate::error::{EngineError, Result};
use crate::models::{ModelArtifact, ModelKind, ValidationMetrics};
use crate::observability::EngineMetrics;
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Per-kind status exposed to operators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStatus {
    pub kind: ModelKind,
    pub active_version: Option<String>,
    pub trained_at: Option<DateTime<Utc>>,
    pub promoted_at: Option<DateTime<Utc>>,
    pub validation_metrics: Option<ValidationMetrics>,
    /// Superseded versions still available for rollback
    pub retained_versions: Vec<String>,
}

#[derive(Default)]
struct Lineage {
    promoted_at: Option<DateTime<Utc>>,
    /// Oldest first
    retired: Vec<Arc<ModelArtifact>>,
}

pub struct ModelRegistry {
    /// One pointer per kind, created up front; the map itself never changes
    active: HashMap<ModelKind, ArcSwapOption<ModelArtifact>>,
    lineage: RwLock<HashMap<ModelKind, Lineage>>,
    promotion_locks: DashMap<ModelKind, Arc<Mutex<()>>>,
    version_counters: DashMap<ModelKind, u64>,
    store: Option<ArtifactStore>,
    metrics: EngineMetrics,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Numeric suffix of a `<kind>-v<n>` version id
fn version_number(version_id: &str) -> Option<u64> {
    version_id.rsplit_once("-v").and_then(|(_, n)| n.parse().ok())
}

impl ModelRegistry {
    /// In-memory registry
    pub fn new() -> Self {
        Self {
            active: ModelKind::ALL
                .into_iter()
                .map(|kind| (kind, ArcSwapOption::empty()))
                .collect(),
            lineage: RwLock::new(HashMap::new()),
            promotion_locks: DashMap::new(),
            version_counters: DashMap::new(),
            store: None,
            metrics: EngineMetrics::new(),
        }
    }

    /// Registry that persists every promotion under `store`
    pub fn with_store(store: ArtifactStore) -> Self {
        Self {
            store: Some(store),
            ..Self::new()
        }
    }

    fn pointer(&self, kind: ModelKind) -> Result<&ArcSwapOption<ModelArtifact>> {
        self.active
            .get(&kind)
            .ok_or_else(|| EngineError::invalid(format!("unknown model kind {}", kind)))
    }

    fn load_active(&self, kind: ModelKind) -> Option<Arc<ModelArtifact>> {
        self.active.get(&kind).and_then(|pointer| pointer.load_full())
    }

    fn promotion_lock(&self, kind: ModelKind) -> Arc<Mutex<()>> {
        self.promotion_locks
            .entry(kind)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Fresh version id of the form `<kind>-v<n>`
    pub fn next_version_id(&self, kind: ModelKind) -> String {
        let mut counter = self.version_counters.entry(kind).or_insert(0);
        *counter += 1;
        format!("{}-v{}", kind, *counter)
    }

    fn observe_version(&self, kind: ModelKind, version_id: &str) {
        if let Some(n) = version_number(version_id) {
            let mut counter = self.version_counters.entry(kind).or_insert(0);
            if *counter < n {
                *counter = n;
            }
        }
    }

    /// Snapshot of the active artifact for `kind`; never waits on a promotion
    pub async fn get_active(&self, kind: ModelKind) -> Result<Arc<ModelArtifact>> {
        self.load_active(kind).ok_or(EngineError::NoModelAvailable(kind))
    }

    /// Make `candidate` the active artifact of its kind, retiring the previous one
    pub async fn promote(&self, candidate: ModelArtifact) -> Result<Arc<ModelArtifact>> {
        let kind = candidate.kind;
        if candidate.parameters.kind() != kind {
            return Err(EngineError::invalid(format!(
                "artifact {} declares kind {} but carries {} parameters",
                candidate.version_id,
                kind,
                candidate.parameters.kind()
            )));
        }
        if kind.is_price() && candidate.schema.is_none() {
            return Err(EngineError::invalid(format!(
                "price artifact {} has no feature schema",
                candidate.version_id
            )));
        }

        let pointer = self.pointer(kind)?;
        let lock = self.promotion_lock(kind);
        let _guard = lock.lock().await;

        if self.versions(kind).await.contains(&candidate.version_id) {
            return Err(EngineError::invalid(format!(
                "version {} is already registered",
                candidate.version_id
            )));
        }

        // Persist before the swap; a failed write leaves the active artifact in place
        if let Some(store) = &self.store {
            store.save(&candidate).await?;
        }

        let candidate = Arc::new(candidate);
        let previous = pointer.swap(Some(candidate.clone()));
        {
            let mut lineage = self.lineage.write().await;
            let entry = lineage.entry(kind).or_default();
            entry.promoted_at = Some(Utc::now());
            if let Some(old) = &previous {
                entry.retired.push(old.clone());
            }
        }

        self.observe_version(kind, &candidate.version_id);
        self.write_manifest().await;
        self.metrics.record_promotion(
            kind,
            previous.as_ref().map(|p| p.version_id.as_str()),
            &candidate.version_id,
        );
        info!(
            kind = %kind,
            version = %candidate.version_id,
            previous = previous.as_ref().map(|p| p.version_id.as_str()).unwrap_or("none"),
            "Activated model artifact"
        );
        Ok(candidate)
    }

    /// Reactivate the most recently retired version; the current one is dropped
    pub async fn rollback(&self, kind: ModelKind) -> Result<Arc<ModelArtifact>> {
        let pointer = self.pointer(kind)?;
        let lock = self.promotion_lock(kind);
        let _guard = lock.lock().await;

        if pointer.load().is_none() {
            return Err(EngineError::NoModelAvailable(kind));
        }
        let restored = {
            let mut lineage = self.lineage.write().await;
            let entry = lineage.entry(kind).or_default();
            let restored = entry.retired.pop().ok_or_else(|| {
                EngineError::invalid(format!("no retired {} version to roll back to", kind))
            })?;
            entry.promoted_at = Some(Utc::now());
            restored
        };
        let dropped = pointer.swap(Some(restored.clone()));

        if let (Some(store), Some(dropped)) = (&self.store, &dropped) {
            if let Err(e) = store.remove(&dropped.version_id).await {
                warn!(version = %dropped.version_id, error = %e, "Failed to delete rolled back artifact");
            }
        }
        self.write_manifest().await;
        self.metrics.record_promotion(
            kind,
            dropped.as_ref().map(|d| d.version_id.as_str()),
            &restored.version_id,
        );
        warn!(
            kind = %kind,
            restored = %restored.version_id,
            dropped = dropped.as_ref().map(|d| d.version_id.as_str()).unwrap_or("none"),
            "Rolled back model artifact"
        );
        Ok(restored)
    }

    /// Drop all but the newest `keep` retired versions; returns how many were removed
    pub async fn prune(&self, kind: ModelKind, keep: usize) -> usize {
        let lock = self.promotion_lock(kind);
        let _guard = lock.lock().await;

        let removed: Vec<Arc<ModelArtifact>> = {
            let mut lineage = self.lineage.write().await;
            match lineage.get_mut(&kind) {
                Some(entry) if entry.retired.len() > keep => {
                    let excess = entry.retired.len() - keep;
                    entry.retired.drain(..excess).collect()
                }
                _ => Vec::new(),
            }
        };

        if let Some(store) = &self.store {
            for artifact in &removed {
                if let Err(e) = store.remove(&artifact.version_id).await {
                    warn!(version = %artifact.version_id, error = %e, "Failed to delete pruned artifact");
                }
            }
        }
        removed.len()
    }

    /// Retained versions oldest first, active version last
    pub async fn versions(&self, kind: ModelKind) -> Vec<String> {
        let lineage = self.lineage.read().await;
        let active = self.load_active(kind);
        lineage
            .get(&kind)
            .map(|entry| entry.retired.as_slice())
            .unwrap_or_default()
            .iter()
            .chain(active.iter())
            .map(|a| a.version_id.clone())
            .collect()
    }

    pub async fn status_of(&self, kind: ModelKind) -> ModelStatus {
        let lineage = self.lineage.read().await;
        let entry = lineage.get(&kind);
        let active = self.load_active(kind);
        ModelStatus {
            kind,
            active_version: active.as_ref().map(|a| a.version_id.clone()),
            trained_at: active.as_ref().map(|a| a.trained_at),
            promoted_at: entry.and_then(|e| e.promoted_at),
            validation_metrics: active.as_ref().map(|a| a.validation_metrics.clone()),
            retained_versions: entry
                .map(|e| e.retired.iter().map(|a| a.version_id.clone()).collect())
                .unwrap_or_default(),
        }
    }

    /// Status of every model kind
    pub async fn status(&self) -> BTreeMap<ModelKind, ModelStatus> {
        let mut status = BTreeMap::new();
        for kind in ModelKind::ALL {
            status.insert(kind, self.status_of(kind).await);
        }
        status
    }

    /// Number of kinds with an active artifact
    pub async fn active_count(&self) -> usize {
        self.active
            .values()
            .filter(|pointer| pointer.load().is_some())
            .count()
    }

    async fn write_manifest(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let manifest = Manifest {
            active: self
                .active
                .iter()
                .filter_map(|(kind, pointer)| pointer.load_full().map(|a| (*kind, a.version_id.clone())))
                .collect(),
        };
        // The artifact itself is already on disk; a stale manifest only affects restarts
        if let Err(e) = store.save_manifest(&manifest).await {
            warn!(error = %e, "Failed to write active model manifest");
        }
    }

    /// Reload persisted artifacts; returns the number of active kinds restored
    pub async fn restore(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let stored = store.load_all().await?;

        let mut lineage: HashMap<ModelKind, Lineage> = HashMap::new();
        let mut active: HashMap<ModelKind, Arc<ModelArtifact>> = HashMap::new();
        for artifact in stored.artifacts {
            self.observe_version(artifact.kind, &artifact.version_id);
            let kind = artifact.kind;
            let is_active = stored.manifest.active.get(&kind) == Some(&artifact.version_id);
            let entry = lineage.entry(kind).or_default();
            let artifact = Arc::new(artifact);
            if is_active {
                active.insert(kind, artifact);
                entry.promoted_at = Some(Utc::now());
            } else {
                entry.retired.push(artifact);
            }
        }

        for (kind, version) in &stored.manifest.active {
            if !active.contains_key(kind) {
                return Err(EngineError::Persistence(format!(
                    "manifest names active {} version {} but no artifact was found",
                    kind, version
                )));
            }
        }

        for (kind, artifact) in &active {
            self.metrics.record_promotion(*kind, None, &artifact.version_id);
        }
        let restored = active.len();
        *self.lineage.write().await = lineage;
        for (kind, pointer) in &self.active {
            pointer.store(active.remove(kind));
        }
        info!(active_models = restored, root = %store.root().display(), "Restored model registry");
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArtifactParameters, TrainingSummary};
    use crate::recommender::RecommendationParams;
    use std::time::Duration;

    fn artifact(registry: &ModelRegistry, error: f64) -> ModelArtifact {
        let kind = ModelKind::CropRecommendation;
        ModelArtifact {
            version_id: registry.next_version_id(kind),
            kind,
            trained_at: Utc::now(),
            parameters: ArtifactParameters::Recommendation(RecommendationParams::default()),
            validation_metrics: ValidationMetrics {
                primary_error: error,
                mape: None,
                rmse: None,
                interval_coverage: None,
                samples: 10,
            },
            schema: None,
            training: TrainingSummary {
                series_used: 1,
                training_samples: 10,
            },
        }
    }

    #[tokio::test]
    async fn test_no_model_before_promotion() {
        let registry = ModelRegistry::new();
        let err = registry.get_active(ModelKind::PriceEnsemble).await.unwrap_err();
        assert!(matches!(err, EngineError::NoModelAvailable(ModelKind::PriceEnsemble)));
        let status = registry.status().await;
        assert_eq!(status.len(), ModelKind::ALL.len());
        assert!(status.values().all(|s| s.active_version.is_none()));
    }

    #[tokio::test]
    async fn test_promote_retains_previous() {
        let registry = ModelRegistry::new();
        let kind = ModelKind::CropRecommendation;
        registry.promote(artifact(&registry, 0.2)).await.unwrap();
        let snapshot = registry.get_active(kind).await.unwrap();
        registry.promote(artifact(&registry, 0.1)).await.unwrap();

        // A reader holding the old snapshot keeps a complete artifact
        assert_eq!(snapshot.version_id, "crop-recommendation-v1");
        assert_eq!(snapshot.validation_metrics.primary_error, 0.2);

        let active = registry.get_active(kind).await.unwrap();
        assert_eq!(active.version_id, "crop-recommendation-v2");
        assert_eq!(
            registry.versions(kind).await,
            vec!["crop-recommendation-v1", "crop-recommendation-v2"]
        );
        assert_eq!(
            registry.status_of(kind).await.retained_versions,
            vec!["crop-recommendation-v1"]
        );
    }

    #[tokio::test]
    async fn test_rollback_and_prune() {
        let registry = ModelRegistry::new();
        let kind = ModelKind::CropRecommendation;
        for error in [0.3, 0.2, 0.1] {
            registry.promote(artifact(&registry, error)).await.unwrap();
        }

        let restored = registry.rollback(kind).await.unwrap();
        assert_eq!(restored.version_id, "crop-recommendation-v2");
        assert_eq!(registry.get_active(kind).await.unwrap().version_id, "crop-recommendation-v2");

        assert_eq!(registry.prune(kind, 0).await, 1);
        assert!(registry.rollback(kind).await.is_err());
        assert_eq!(registry.versions(kind).await, vec!["crop-recommendation-v2"]);
    }

    #[tokio::test]
    async fn test_duplicate_and_malformed_candidates_rejected() {
        let registry = ModelRegistry::new();
        let first = artifact(&registry, 0.2);
        registry.promote(first.clone()).await.unwrap();
        assert!(registry.promote(first).await.is_err());

        let mut mislabeled = artifact(&registry, 0.1);
        mislabeled.kind = ModelKind::PriceTrend;
        assert!(matches!(
            registry.promote(mislabeled).await,
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_readers_see_whole_artifacts() {
        let registry = Arc::new(ModelRegistry::new());
        let kind = ModelKind::CropRecommendation;
        registry.promote(artifact(&registry, 1.0)).await.unwrap();

        let writer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for i in 0..20 {
                    let candidate = artifact(&registry, 1.0 / (i as f64 + 2.0));
                    registry.promote(candidate).await.unwrap();
                }
            })
        };
        let mut readers = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let active = registry.get_active(kind).await.unwrap();
                    // Version n always carries error 1 / n
                    let n = version_number(&active.version_id).unwrap() as f64;
                    assert!((active.validation_metrics.primary_error - 1.0 / n).abs() < 1e-12);
                    tokio::task::yield_now().await;
                }
            }));
        }
        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_readers_do_not_wait_on_pending_promotion() {
        let registry = Arc::new(ModelRegistry::new());
        let kind = ModelKind::CropRecommendation;
        registry.promote(artifact(&registry, 0.2)).await.unwrap();

        // A writer stalled on the lineage lock must not hold up readers
        let held = registry.lineage.write().await;
        let promotion = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.promote(artifact(&registry, 0.1)).await })
        };
        tokio::task::yield_now().await;

        let active = tokio::time::timeout(Duration::from_millis(200), registry.get_active(kind))
            .await
            .expect("reader blocked behind a writer")
            .unwrap();
        assert!(active.version_id.starts_with("crop-recommendation-v"));
        assert_eq!(
            tokio::time::timeout(Duration::from_millis(200), registry.active_count())
                .await
                .unwrap(),
            1
        );

        drop(held);
        promotion.await.unwrap().unwrap();
        assert_eq!(registry.get_active(kind).await.unwrap().version_id, "crop-recommendation-v2");
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let kind = ModelKind::CropRecommendation;
        {
            let registry = ModelRegistry::with_store(ArtifactStore::new(dir.path()));
            registry.promote(artifact(&registry, 0.2)).await.unwrap();
            registry.promote(artifact(&registry, 0.1)).await.unwrap();
        }

        let registry = ModelRegistry::with_store(ArtifactStore::new(dir.path()));
        assert_eq!(registry.restore().await.unwrap(), 1);
        let active = registry.get_active(kind).await.unwrap();
        assert_eq!(active.version_id, "crop-recommendation-v2");
        assert_eq!(registry.status_of(kind).await.retained_versions.len(), 1);
        assert_eq!(registry.next_version_id(kind), "crop-recommendation-v3");
    }
}
