//! Integration tests for the engine HTTP API

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use crop_engine::api::{create_router, status_for, AppState};
use engine_lib::history::InMemoryPriceStore;
use engine_lib::{CropCatalog, CropEngine, EngineConfig, EngineError, ModelKind, PriceObservation};
use std::collections::HashSet;
use std::sync::Arc;
use tower::ServiceExt;

/// Rising rice prices in Thanjavur ending yesterday, plus two cotton points
fn store() -> InMemoryPriceStore {
    let store = InMemoryPriceStore::new();
    let start = Utc::now() - Duration::days(90);
    store.extend((0..90).map(|d| {
        let wobble = if d % 2 == 0 { 0.2 } else { -0.2 };
        PriceObservation::new("rice", "Thanjavur", start + Duration::days(d), 20.0 + 0.1 * d as f64 + wobble)
    }));
    store.insert(PriceObservation::new("cotton", "Thanjavur", Utc::now() - Duration::days(3), 70.0));
    store.insert(PriceObservation::new("cotton", "Thanjavur", Utc::now() - Duration::days(2), 71.0));
    store
}

fn setup_engine() -> Arc<CropEngine> {
    let config = EngineConfig {
        price_model: ModelKind::PriceTrend,
        ..EngineConfig::default()
    };
    Arc::new(CropEngine::new(Arc::new(store()), CropCatalog::tamil_nadu(), config).unwrap())
}

async fn setup_test_app() -> Router {
    let engine = setup_engine();
    engine.initialize().await.unwrap();
    create_router(Arc::new(AppState::new(engine)))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn predict_body(crop_id: &str, days_ahead: i64) -> serde_json::Value {
    let target = Utc::now().date_naive() + Duration::days(days_ahead);
    serde_json::json!({
        "crop_id": crop_id,
        "district": "Thanjavur",
        "target_date": target.format("%Y-%m-%d").to_string(),
    })
}

async fn train_price_model(app: &Router) {
    let (status, body) = send(app, post_json("/train-models", serde_json::json!({"kinds": ["price-trend"]}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["kind"], "price-trend");
    assert_eq!(body[0]["report"]["decision"]["outcome"], "promoted");
}

#[tokio::test]
async fn test_readyz_before_and_after_initialize() {
    let engine = setup_engine();
    let app = create_router(Arc::new(AppState::new(engine.clone())));

    let (status, body) = send(&app, get("/readyz")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["ready"], false);

    engine.initialize().await.unwrap();
    let (status, body) = send(&app, get("/readyz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn test_healthz_degraded_without_models() {
    let app = setup_test_app().await;

    let (status, body) = send(&app, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["components"]["price_model"]["status"], "degraded");
    assert_eq!(body["components"]["history_store"]["status"], "healthy");
}

#[tokio::test]
async fn test_predict_before_training_is_unavailable() {
    let app = setup_test_app().await;

    let (status, body) = send(&app, post_json("/predict-price", predict_body("rice", 6))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "no_model_available");
}

#[tokio::test]
async fn test_predict_rejects_malformed_date() {
    let app = setup_test_app().await;

    let body = serde_json::json!({"crop_id": "rice", "district": "Thanjavur", "target_date": "next week"});
    let (status, body) = send(&app, post_json("/predict-price", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_argument");
}

#[tokio::test]
async fn test_train_then_predict() {
    let app = setup_test_app().await;
    train_price_model(&app).await;

    let (status, body) = send(&app, post_json("/predict-price", predict_body("rice", 6))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["crop_id"], "rice");
    assert_eq!(body["model_version"], "price-trend-v1");
    let price = body["predicted_price"].as_f64().unwrap();
    assert!(price > 28.0 && price < 32.0, "price {}", price);
    let confidence = body["confidence_score"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&confidence));

    let (status, body) = send(&app, post_json("/predict-price", predict_body("cotton", 6))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "insufficient_data");

    let (status, body) = send(&app, post_json("/predict-price", predict_body("tea", 6))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, body) = send(&app, get("/model-status")).await;
    assert_eq!(status, StatusCode::OK);
    let trend = body
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["kind"] == "price-trend")
        .unwrap();
    assert_eq!(trend["active_version"], "price-trend-v1");
    assert_eq!(trend["phase"], "idle");
}

#[tokio::test]
async fn test_price_history_and_analytics() {
    let app = setup_test_app().await;

    let (status, body) = send(&app, get("/price-history/rice?district=Thanjavur&days=10")).await;
    assert_eq!(status, StatusCode::OK);
    let observations = body["observations"].as_array().unwrap();
    assert!(!observations.is_empty() && observations.len() <= 10);

    let (status, body) = send(&app, get("/price-history/tea?district=Thanjavur")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, body) = send(&app, get("/analytics?crop_id=rice&district=Thanjavur&days=60")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["trend"], "increasing");
    assert!(body["change_percent"].as_f64().unwrap() > 5.0);
    assert!(!body["advice"].as_str().unwrap().is_empty());
    assert_eq!(body["period"]["days"], 60);
    let trends = body["price_trends"].as_array().unwrap();
    assert_eq!(trends.len() as u64, body["observation_count"].as_u64().unwrap());
}

#[tokio::test]
async fn test_history_and_analytics_without_filters() {
    let app = setup_test_app().await;

    // Every district, one crop
    let (status, body) = send(&app, get("/price-history/cotton?days=10")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["district"].is_null());
    let observations = body["observations"].as_array().unwrap();
    assert_eq!(observations.len(), 2);
    assert!(observations.iter().all(|o| o["crop_id"] == "cotton"));

    // Market-wide: rice and cotton together
    let (status, body) = send(&app, get("/analytics?days=10")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["crop_id"].is_null());
    let crops: HashSet<&str> = body["price_trends"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|o| o["crop_id"].as_str())
        .collect();
    assert_eq!(crops, HashSet::from(["rice", "cotton"]));

    // District only
    let (status, body) = send(&app, get("/analytics?district=Thanjavur&days=10")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["observation_count"].as_u64().unwrap() > 2);

    let (status, body) = send(&app, get("/analytics?district=Erode")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["observation_count"], 0);
    assert_eq!(body["trend"], "stable");
}

#[tokio::test]
async fn test_recommendations_validation() {
    let app = setup_test_app().await;

    let (status, body) = send(&app, get("/recommendations?district=Thanjavur&user_type=landlord")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_argument");

    let (status, body) = send(&app, get("/recommendations?district=Thanjavur&season=kharif&user_type=farmer")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "no_model_available");
}

#[tokio::test]
async fn test_rollback_routes() {
    let app = setup_test_app().await;

    let (status, body) = send(&app, post_json("/models/price-trend/rollback", serde_json::json!({}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "no_model_available");

    let (status, _) = send(&app, post_json("/models/price-magic/rollback", serde_json::json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = setup_test_app().await;
    train_price_model(&app).await;
    let (status, _) = send(&app, post_json("/predict-price", predict_body("rice", 6))).await;
    assert_eq!(status, StatusCode::OK);

    let response = app.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("crop_engine_forecasts_total"));
    assert!(text.contains("crop_engine_promotions_total"));
}

#[test]
fn test_each_error_kind_has_its_own_status() {
    let errors = [
        EngineError::InvalidArgument("x".into()),
        EngineError::NotFound {
            crop_id: "rice".into(),
            district: "Thanjavur".into(),
        },
        EngineError::InsufficientData { required: 3, found: 1 },
        EngineError::SchemaMismatch {
            expected: "a".into(),
            found: "b".into(),
        },
        EngineError::NoModelAvailable(ModelKind::PriceTrend),
        EngineError::Training("x".into()),
        EngineError::StoreUnavailable {
            attempts: 3,
            reason: "down".into(),
        },
        EngineError::Cancelled,
        EngineError::Persistence("x".into()),
    ];
    let statuses: HashSet<StatusCode> = errors.iter().map(status_for).collect();
    assert_eq!(statuses.len(), errors.len());
}
