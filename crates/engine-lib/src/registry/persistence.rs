//! On-disk artifact store
//!
//! Layout under the root directory:
//! - `<version_id>.json`: envelope holding the artifact JSON and its SHA-256
//! - `active.json`: manifest mapping each model kind to its active version
//!
//! Every file is written to a temporary sibling and renamed into place so a
//! crash never leaves a half-written artifact behind.

use crate::error::{EngineError, Result};
use crate::models::{ModelArtifact, ModelKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

const MANIFEST_FILE: &str = "active.json";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    checksum: String,
    /// Artifact serialized as JSON; the checksum covers these exact bytes
    payload: String,
}

/// Active version per kind
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub active: BTreeMap<ModelKind, String>,
}

/// Everything found on disk
#[derive(Debug, Default)]
pub struct StoredArtifacts {
    pub manifest: Manifest,
    /// Oldest first by training time
    pub artifacts: Vec<ModelArtifact>,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

fn checksum(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_path(&self, version_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", version_id))
    }

    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn save(&self, artifact: &ModelArtifact) -> Result<()> {
        if artifact.version_id.contains(&['/', '\\'][..]) || artifact.version_id.starts_with('.') {
            return Err(EngineError::Persistence(format!(
                "version id '{}' is not a valid file name",
                artifact.version_id
            )));
        }
        let payload = serde_json::to_string(artifact)?;
        let envelope = Envelope {
            checksum: checksum(&payload),
            payload,
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;
        self.write_atomic(&self.artifact_path(&artifact.version_id), &bytes)
            .await?;
        debug!(version = %artifact.version_id, "Persisted model artifact");
        Ok(())
    }

    pub async fn save_manifest(&self, manifest: &Manifest) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(manifest)?;
        self.write_atomic(&self.root.join(MANIFEST_FILE), &bytes).await
    }

    /// Delete a persisted artifact; missing files are not an error
    pub async fn remove(&self, version_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.artifact_path(version_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read one artifact, verifying its checksum
    pub async fn load(&self, path: &Path) -> Result<ModelArtifact> {
        let raw = tokio::fs::read_to_string(path).await?;
        let envelope: Envelope = serde_json::from_str(&raw)?;
        if checksum(&envelope.payload) != envelope.checksum {
            return Err(EngineError::Persistence(format!(
                "checksum mismatch in {}",
                path.display()
            )));
        }
        Ok(serde_json::from_str(&envelope.payload)?)
    }

    /// Load the manifest and every artifact; an empty or missing root yields nothing
    pub async fn load_all(&self) -> Result<StoredArtifacts> {
        let mut stored = StoredArtifacts::default();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stored),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if !is_json {
                continue;
            }
            if name == MANIFEST_FILE {
                let raw = tokio::fs::read_to_string(&path).await?;
                stored.manifest = serde_json::from_str(&raw)?;
                continue;
            }
            stored.artifacts.push(self.load(&path).await?);
        }

        stored.artifacts.sort_by(|a, b| {
            a.trained_at
                .cmp(&b.trained_at)
                .then_with(|| a.version_id.cmp(&b.version_id))
        });
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArtifactParameters, TrainingSummary, ValidationMetrics};
    use crate::recommender::RecommendationParams;
    use chrono::Utc;

    fn artifact(version: &str) -> ModelArtifact {
        ModelArtifact {
            version_id: version.to_string(),
            kind: ModelKind::CropRecommendation,
            trained_at: Utc::now(),
            parameters: ArtifactParameters::Recommendation(RecommendationParams::default()),
            validation_metrics: ValidationMetrics {
                primary_error: 0.1,
                mape: None,
                rmse: None,
                interval_coverage: None,
                samples: 4,
            },
            schema: None,
            training: TrainingSummary {
                series_used: 1,
                training_samples: 4,
            },
        }
    }

    #[tokio::test]
    async fn test_save_and_load_all() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("artifacts"));

        store.save(&artifact("crop-recommendation-v1")).await.unwrap();
        store.save(&artifact("crop-recommendation-v2")).await.unwrap();
        let mut manifest = Manifest::default();
        manifest
            .active
            .insert(ModelKind::CropRecommendation, "crop-recommendation-v2".to_string());
        store.save_manifest(&manifest).await.unwrap();

        let stored = store.load_all().await.unwrap();
        assert_eq!(stored.artifacts.len(), 2);
        assert_eq!(stored.artifacts[1].version_id, "crop-recommendation-v2");
        assert_eq!(stored.manifest, manifest);
    }

    #[tokio::test]
    async fn test_tampered_artifact_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.save(&artifact("crop-recommendation-v1")).await.unwrap();

        let path = dir.path().join("crop-recommendation-v1.json");
        let raw = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, raw.replace("0.1", "0.01")).unwrap();

        let err = store.load_all().await.unwrap_err();
        assert!(matches!(err, EngineError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("nope"));
        let stored = store.load_all().await.unwrap();
        assert!(stored.artifacts.is_empty());
        store.remove("anything").await.unwrap();
    }

    #[tokio::test]
    async fn test_unsafe_version_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        assert!(store.save(&artifact("../escape")).await.is_err());
    }
}
