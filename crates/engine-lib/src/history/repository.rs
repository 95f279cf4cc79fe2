//! History repository
//!
//! Fetches a price series, or every series matching optional crop and
//! district filters, from the store. Transient failures are retried with
//! exponential backoff and the result is normalized: oldest first, one
//! observation per series and timestamp. Gaps are passed through untouched.

use super::store::{PriceStore, StoreError};
use crate::error::{EngineError, Result};
use crate::models::{HistoryWindow, PriceObservation};
use crate::observability::EngineMetrics;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Label used in `NotFound` for a filter that was left open
const ANY: &str = "any";

/// Retry policy for transient store failures
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 1_000,
        }
    }
}

/// Which series a fetch covers
#[derive(Debug, Clone, Copy)]
enum Selection<'a> {
    Series { crop_id: &'a str, district: &'a str },
    Filtered { crop_id: Option<&'a str>, district: Option<&'a str> },
}

impl Selection<'_> {
    fn crop_label(&self) -> &str {
        match *self {
            Selection::Series { crop_id, .. } => crop_id,
            Selection::Filtered { crop_id, .. } => crop_id.unwrap_or(ANY),
        }
    }

    fn district_label(&self) -> &str {
        match *self {
            Selection::Series { district, .. } => district,
            Selection::Filtered { district, .. } => district.unwrap_or(ANY),
        }
    }

    fn matches(&self, observation: &PriceObservation) -> bool {
        match *self {
            Selection::Series { crop_id, district } => {
                observation.crop_id == crop_id && observation.district == district
            }
            Selection::Filtered { crop_id, district } => {
                crop_id.map_or(true, |c| observation.crop_id == c)
                    && district.map_or(true, |d| observation.district == d)
            }
        }
    }

    fn not_found(&self) -> EngineError {
        EngineError::NotFound {
            crop_id: self.crop_label().to_string(),
            district: self.district_label().to_string(),
        }
    }
}

impl RetryConfig {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

/// Reads normalized price history from a [`PriceStore`]
pub struct HistoryRepository {
    store: Arc<dyn PriceStore>,
    retry: RetryConfig,
    metrics: EngineMetrics,
}

impl HistoryRepository {
    pub fn new(store: Arc<dyn PriceStore>, retry: RetryConfig) -> Self {
        Self {
            store,
            retry,
            metrics: EngineMetrics::new(),
        }
    }

    /// Ordered, deduplicated observations for the series inside `window`
    pub async fn get_history(
        &self,
        crop_id: &str,
        district: &str,
        window: HistoryWindow,
        cancel: &CancellationToken,
    ) -> Result<Vec<PriceObservation>> {
        if crop_id.trim().is_empty() {
            return Err(EngineError::invalid("crop_id must not be empty"));
        }
        if district.trim().is_empty() {
            return Err(EngineError::invalid("district must not be empty"));
        }

        let (start, end) = window.resolve(Utc::now());
        if start > end {
            return Err(EngineError::invalid("history window starts after it ends"));
        }

        self.fetch(Selection::Series { crop_id, district }, window, cancel)
            .await
    }

    /// Observations across every series matching the filters inside `window`.
    ///
    /// A `None` or blank filter matches everything; with both filters set this
    /// is [`get_history`](Self::get_history). Ordered by timestamp, then series.
    pub async fn get_market_history(
        &self,
        crop_id: Option<&str>,
        district: Option<&str>,
        window: HistoryWindow,
        cancel: &CancellationToken,
    ) -> Result<Vec<PriceObservation>> {
        let crop_id = crop_id.map(str::trim).filter(|c| !c.is_empty());
        let district = district.map(str::trim).filter(|d| !d.is_empty());
        if let (Some(crop_id), Some(district)) = (crop_id, district) {
            return self.get_history(crop_id, district, window, cancel).await;
        }

        let (start, end) = window.resolve(Utc::now());
        if start > end {
            return Err(EngineError::invalid("history window starts after it ends"));
        }
        self.fetch(Selection::Filtered { crop_id, district }, window, cancel)
            .await
    }

    async fn fetch(
        &self,
        selection: Selection<'_>,
        window: HistoryWindow,
        cancel: &CancellationToken,
    ) -> Result<Vec<PriceObservation>> {
        let raw = self.fetch_with_retry(selection, window, cancel).await?;
        let observations = normalize(raw, &selection);

        if observations.is_empty() {
            return Err(selection.not_found());
        }

        debug!(
            crop_id = %selection.crop_label(),
            district = %selection.district_label(),
            observations = observations.len(),
            "Loaded price history"
        );
        Ok(observations)
    }

    async fn fetch_with_retry(
        &self,
        selection: Selection<'_>,
        window: HistoryWindow,
        cancel: &CancellationToken,
    ) -> Result<Vec<PriceObservation>> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let (start, end) = window.resolve(Utc::now());

            let query = match selection {
                Selection::Series { crop_id, district } => self.store.query(crop_id, district, start, end),
                Selection::Filtered { crop_id, district } => {
                    self.store.query_filtered(crop_id, district, start, end)
                }
            };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                result = query => result,
            };

            match outcome {
                Ok(observations) => return Ok(observations),
                Err(StoreError::Rejected(reason)) => {
                    return Err(EngineError::StoreUnavailable {
                        attempts: attempt,
                        reason,
                    })
                }
                Err(err @ StoreError::Unavailable(_)) if attempt < max_attempts => {
                    let backoff = self.retry.backoff(attempt);
                    warn!(
                        crop_id = %selection.crop_label(),
                        district = %selection.district_label(),
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Price store fetch failed, retrying"
                    );
                    self.metrics.inc_store_retries();
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(err) => {
                    return Err(EngineError::StoreUnavailable {
                        attempts: attempt,
                        reason: err.to_string(),
                    })
                }
            }
        }
    }
}

/// Sort oldest first and keep the latest-ingested observation per series and
/// timestamp.
///
/// Records outside the selection and non-positive prices are dropped; the
/// store is trusted for everything else.
fn normalize(mut raw: Vec<PriceObservation>, selection: &Selection<'_>) -> Vec<PriceObservation> {
    raw.retain(|o| selection.matches(o) && o.price > 0.0 && o.price.is_finite());

    // Stable sort keeps store order among equal keys, so the later record wins below.
    raw.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.crop_id.cmp(&b.crop_id))
            .then_with(|| a.district.cmp(&b.district))
            .then(a.recorded_at.cmp(&b.recorded_at))
    });

    let mut normalized: Vec<PriceObservation> = Vec::with_capacity(raw.len());
    for observation in raw {
        match normalized.last_mut() {
            Some(last)
                if last.timestamp == observation.timestamp
                    && last.crop_id == observation.crop_id
                    && last.district == observation.district =>
            {
                *last = observation
            }
            _ => normalized.push(observation),
        }
    }
    normalized
}
