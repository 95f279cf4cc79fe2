//! Historical price access
//!
//! This module provides:
//! - The `PriceStore` query seam to the external price store
//! - An in-memory store for tests and local runs
//! - `HistoryRepository`: normalization, bounded retries and cancellation

mod repository;
mod store;

pub use repository::{HistoryRepository, RetryConfig};
pub use store::{InMemoryPriceStore, PriceStore, StoreError};
