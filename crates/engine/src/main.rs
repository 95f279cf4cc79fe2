//! Crop Engine - crop price forecasting and recommendation service
//!
//! Loads price history and the crop catalog, restores persisted models,
//! retrains on a schedule and serves the engine over HTTP.

use anyhow::{Context, Result};
use crop_engine::{api, config::ServiceConfig};
use engine_lib::history::InMemoryPriceStore;
use engine_lib::{CropCatalog, CropEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting crop-engine");

    let config = ServiceConfig::load().context("failed to load configuration")?;

    let store = match &config.data_file {
        Some(path) => InMemoryPriceStore::from_json_file(path)
            .with_context(|| format!("failed to load price data from {}", path.display()))?,
        None => {
            warn!("No data_file configured, starting with an empty price store");
            InMemoryPriceStore::new()
        }
    };
    info!(series = store.series_count(), observations = store.len(), "Price store loaded");

    let catalog = match &config.catalog_file {
        Some(path) => CropCatalog::from_json_file(path)
            .with_context(|| format!("failed to load crop catalog from {}", path.display()))?,
        None => CropCatalog::tamil_nadu(),
    };

    let engine = Arc::new(
        CropEngine::new(Arc::new(store), catalog, config.engine.clone()).context("invalid engine configuration")?,
    );
    engine.initialize().await.context("failed to restore model registry")?;

    if config.train_on_startup {
        let kinds = engine.config().training.scheduled_kinds.clone();
        for (kind, result) in engine.retrain_all(&kinds).await {
            match result {
                Ok(report) => info!(kind = %kind, promoted = report.promoted(), "Startup training finished"),
                Err(e) => warn!(kind = %kind, error = %e, "Startup training failed"),
            }
        }
    }

    let (shutdown_tx, _) = broadcast::channel(1);

    let scheduler = engine.scheduler(Duration::from_secs(config.retrain_interval_secs.max(1)));
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

    let state = Arc::new(api::AppState::new(engine.clone()));
    let api_handle = tokio::spawn(api::serve(config.api_port, state, shutdown_tx.subscribe()));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    engine.shutdown("SIGINT received");
    let _ = shutdown_tx.send(());

    if let Err(e) = scheduler_handle.await {
        warn!(error = %e, "Retrain scheduler ended abnormally");
    }
    api_handle.await??;
    info!("Shutdown complete");

    Ok(())
}
