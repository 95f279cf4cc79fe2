//! Feature engineering for price series
//!
//! Features include rolling means and variances, a linear trend over the
//! longest window, seasonal indices and stable categorical encodings.

mod builder;
mod encoding;
mod schema;
mod series;
pub mod stats;

pub use builder::{FeatureBuilder, FeatureConfig, MIN_OBSERVATIONS};
pub use encoding::IdentityEncoder;
pub use schema::{FeatureSchema, FeatureView, FEATURE_SCHEMA_VERSION};
pub use series::{DailyPoint, DailySeries, PointKind};
