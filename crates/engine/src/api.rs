//! HTTP API for the engine, health checks and Prometheus metrics
//!
//! Handlers only parse requests and map results; all behavior lives in
//! [`CropEngine`].

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use engine_lib::analytics::{MarketAnalytics, PriceSummary};
use engine_lib::recommender::Recommendations;
use engine_lib::{
    ComponentStatus, CropEngine, EngineError, ModelKind, PriceObservation, RecommendationEntry, Season,
    UserType,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

const DEFAULT_WINDOW_DAYS: u32 = 30;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<CropEngine>,
}

impl AppState {
    pub fn new(engine: Arc<CropEngine>) -> Self {
        Self { engine }
    }
}

/// Engine error rendered as a JSON body with a status per error kind
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
        EngineError::Cancelled => StatusCode::REQUEST_TIMEOUT,
        EngineError::SchemaMismatch { .. } => StatusCode::CONFLICT,
        EngineError::InsufficientData { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Training(_) => StatusCode::INTERNAL_SERVER_ERROR,
        EngineError::StoreUnavailable { .. } => StatusCode::BAD_GATEWAY,
        EngineError::NoModelAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Persistence(_) => StatusCode::INSUFFICIENT_STORAGE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.0.code(),
            message: self.0.to_string(),
        };
        (status_for(&self.0), Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Token cancelled when the handler future is dropped, e.g. on client disconnect
fn request_token() -> (CancellationToken, tokio_util::sync::DropGuard) {
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    (token, guard)
}

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    pub crop_id: String,
    pub district: String,
    /// `YYYY-MM-DD`
    pub target_date: String,
}

#[derive(Debug, Serialize)]
struct PredictResponse {
    crop_id: String,
    district: String,
    #[serde(flatten)]
    forecast: engine_lib::ForecastResult,
}

async fn predict_price(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PredictRequest>,
) -> ApiResult<PredictResponse> {
    let target_date = NaiveDate::parse_from_str(request.target_date.trim(), "%Y-%m-%d").map_err(|e| {
        EngineError::InvalidArgument(format!("target_date '{}': {}", request.target_date, e))
    })?;
    let (cancel, _guard) = request_token();
    let forecast = state
        .engine
        .predict(&request.crop_id, &request.district, target_date, &cancel)
        .await?;
    Ok(Json(PredictResponse {
        crop_id: request.crop_id,
        district: request.district,
        forecast,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RecommendationQuery {
    pub district: String,
    pub season: Option<String>,
    pub user_type: Option<String>,
}

#[derive(Debug, Serialize)]
struct RecommendationResponse {
    district: String,
    season: Season,
    user_type: UserType,
    model_version: String,
    recommendations: Vec<RecommendationEntry>,
    excluded: Vec<String>,
}

async fn recommendations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecommendationQuery>,
) -> ApiResult<RecommendationResponse> {
    let season = match query.season.as_deref() {
        Some(s) => s.parse::<Season>()?,
        None => Season::current(),
    };
    let user_type = match query.user_type.as_deref() {
        Some(u) => u.parse::<UserType>()?,
        None => UserType::Farmer,
    };
    let (cancel, _guard) = request_token();
    let Recommendations {
        entries,
        excluded,
        model_version,
    } = state
        .engine
        .recommend(&query.district, Some(season), user_type, &cancel)
        .await?;
    Ok(Json(RecommendationResponse {
        district: query.district,
        season,
        user_type,
        model_version,
        recommendations: entries,
        excluded,
    }))
}

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    /// All districts when absent
    pub district: Option<String>,
    pub days: Option<u32>,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    crop_id: String,
    district: Option<String>,
    days: u32,
    observations: Vec<PriceObservation>,
}

async fn price_history(
    State(state): State<Arc<AppState>>,
    Path(crop_id): Path<String>,
    Query(query): Query<WindowQuery>,
) -> ApiResult<HistoryResponse> {
    let days = query.days.unwrap_or(DEFAULT_WINDOW_DAYS);
    let (cancel, _guard) = request_token();
    let observations = state
        .engine
        .price_history(Some(&crop_id), query.district.as_deref(), days, &cancel)
        .await?;
    Ok(Json(HistoryResponse {
        crop_id,
        district: query.district,
        days,
        observations,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AnalyticsQuery {
    /// All crops when absent
    pub crop_id: Option<String>,
    /// All districts when absent
    pub district: Option<String>,
    pub days: Option<u32>,
}

#[derive(Debug, Serialize)]
struct AnalyticsPeriod {
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    days: u32,
}

#[derive(Debug, Serialize)]
struct AnalyticsResponse {
    crop_id: Option<String>,
    district: Option<String>,
    period: AnalyticsPeriod,
    #[serde(flatten)]
    summary: PriceSummary,
    advice: &'static str,
    price_trends: Vec<PriceObservation>,
}

async fn analytics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnalyticsQuery>,
) -> ApiResult<AnalyticsResponse> {
    let days = query.days.unwrap_or(DEFAULT_WINDOW_DAYS);
    let (cancel, _guard) = request_token();
    let MarketAnalytics {
        start,
        end,
        days,
        summary,
        observations,
    } = state
        .engine
        .market_analytics(query.crop_id.as_deref(), query.district.as_deref(), days, &cancel)
        .await?;
    Ok(Json(AnalyticsResponse {
        crop_id: query.crop_id,
        district: query.district,
        period: AnalyticsPeriod {
            start_date: start,
            end_date: end,
            days,
        },
        advice: summary.trend.advice(),
        summary,
        price_trends: observations,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct TrainRequest {
    /// Kinds to retrain; the scheduled kinds when absent
    pub kinds: Option<Vec<ModelKind>>,
}

#[derive(Debug, Serialize)]
struct TrainOutcome {
    kind: ModelKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<engine_lib::training::TrainingReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn train_models(
    State(state): State<Arc<AppState>>,
    request: Option<Json<TrainRequest>>,
) -> Json<Vec<TrainOutcome>> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let kinds = request
        .kinds
        .unwrap_or_else(|| state.engine.config().training.scheduled_kinds.clone());
    let outcomes = state
        .engine
        .retrain_all(&kinds)
        .await
        .into_iter()
        .map(|(kind, result)| match result {
            Ok(report) => TrainOutcome {
                kind,
                report: Some(report),
                error: None,
            },
            Err(e) => TrainOutcome {
                kind,
                report: None,
                error: Some(e.to_string()),
            },
        })
        .collect();
    Json(outcomes)
}

async fn model_status(State(state): State<Arc<AppState>>) -> Json<Vec<engine_lib::KindStatus>> {
    Json(state.engine.status().await)
}

async fn rollback(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
) -> ApiResult<engine_lib::registry::ModelStatus> {
    let kind = kind.parse::<ModelKind>()?;
    Ok(Json(state.engine.rollback(kind).await?))
}

/// Health check response - returns 200 if healthy or degraded, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.engine.health_report().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.engine.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/predict-price", post(predict_price))
        .route("/recommendations", get(recommendations))
        .route("/price-history/:crop_id", get(price_history))
        .route("/analytics", get(analytics))
        .route("/train-models", post(train_models))
        .route("/model-status", get(model_status))
        .route("/models/:kind/rollback", post(rollback))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Start the API server; returns once `shutdown` fires
pub async fn serve(port: u16, state: Arc<AppState>, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}
