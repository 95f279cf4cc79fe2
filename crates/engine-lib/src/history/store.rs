//! Price store seam
//!
//! The raw price store is owned by the ingestion side; the engine only needs
//! range queries, either for one series or across series with optional crop
//! and district filters. `InMemoryPriceStore` backs tests and the demo service.

use crate::models::PriceObservation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

/// Failure reported by a store implementation
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Transient failure worth retrying (timeouts, dropped connections)
    #[error("store temporarily unavailable: {0}")]
    Unavailable(String),
    /// Permanent failure for this query
    #[error("store rejected query: {0}")]
    Rejected(String),
}

/// Query primitive exposed by the price store
#[async_trait]
pub trait PriceStore: Send + Sync {
    /// Observations for the series with `start <= timestamp <= end`, in store order
    async fn query(
        &self,
        crop_id: &str,
        district: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PriceObservation>, StoreError>;

    /// Observations across series with `start <= timestamp <= end`; a `None`
    /// filter matches every crop or district
    async fn query_filtered(
        &self,
        crop_id: Option<&str>,
        district: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PriceObservation>, StoreError>;
}

type SeriesKey = (String, String);

/// Concurrent in-memory store keyed by (crop_id, district)
#[derive(Default)]
pub struct InMemoryPriceStore {
    series: DashMap<SeriesKey, Vec<PriceObservation>>,
    /// Number of upcoming queries that fail with `Unavailable`
    injected_failures: AtomicU32,
}

impl InMemoryPriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an observation; ingestion order is preserved
    pub fn insert(&self, observation: PriceObservation) {
        self.series
            .entry((observation.crop_id.clone(), observation.district.clone()))
            .or_default()
            .push(observation);
    }

    pub fn extend(&self, observations: impl IntoIterator<Item = PriceObservation>) {
        for observation in observations {
            self.insert(observation);
        }
    }

    /// Load observations from a JSON array file
    pub fn from_json_file(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let observations: Vec<PriceObservation> = serde_json::from_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let store = Self::new();
        store.extend(observations.into_iter().filter(|o| o.price > 0.0));
        Ok(store)
    }

    /// Make the next `count` queries fail transiently
    pub fn fail_next(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    pub fn len(&self) -> usize {
        self.series.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_injected_failure(&self) -> Result<(), StoreError> {
        let injected = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::Unavailable("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl PriceStore for InMemoryPriceStore {
    async fn query(
        &self,
        crop_id: &str,
        district: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PriceObservation>, StoreError> {
        self.take_injected_failure()?;

        let key = (crop_id.to_string(), district.to_string());
        let observations = self
            .series
            .get(&key)
            .map(|series| {
                series
                    .iter()
                    .filter(|o| o.timestamp >= start && o.timestamp <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(observations)
    }

    async fn query_filtered(
        &self,
        crop_id: Option<&str>,
        district: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PriceObservation>, StoreError> {
        self.take_injected_failure()?;

        let observations = self
            .series
            .iter()
            .filter(|entry| {
                let (crop, dist) = entry.key();
                crop_id.map_or(true, |c| c == crop) && district.map_or(true, |d| d == dist)
            })
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|o| o.timestamp >= start && o.timestamp <= end)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        Ok(observations)
    }
}
