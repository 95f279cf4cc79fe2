//! Periodic retraining loop

use super::{TrainingDecision, TrainingReport};
use crate::error::Result;
use crate::models::ModelKind;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

/// Runs one retraining round; the engine implements this so scheduled rounds
/// update health and metrics like on-demand ones
#[async_trait]
pub trait Retrainer: Send + Sync {
    async fn retrain_all(&self, kinds: &[ModelKind]) -> Vec<(ModelKind, Result<TrainingReport>)>;
}

/// Retrains the configured kinds on a fixed interval until shutdown
pub struct RetrainScheduler {
    retrainer: Arc<dyn Retrainer>,
    interval: Duration,
    kinds: Vec<ModelKind>,
}

impl RetrainScheduler {
    pub fn new(retrainer: Arc<dyn Retrainer>, interval: Duration, kinds: Vec<ModelKind>) -> Self {
        Self {
            retrainer,
            interval,
            kinds,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            kinds = ?self.kinds,
            "Starting retrain scheduler"
        );

        // First round one interval after start
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down retrain scheduler");
                    break;
                }
            }
        }
    }

    /// One round over every scheduled kind; failures are logged, never fatal
    pub async fn run_once(&self) -> usize {
        let mut promoted = 0;
        for (kind, result) in self.retrainer.retrain_all(&self.kinds).await {
            match result {
                Ok(report) => {
                    if report.decision == TrainingDecision::Promoted {
                        promoted += 1;
                    }
                }
                Err(e) => warn!(kind = %kind, error = %e, "Scheduled retraining failed"),
            }
        }
        promoted
    }
}
