//! API layer -- axum routes, handlers, and middleware.

mod routes;
pub mod state;

use self::state::AppState;
use axum::Router;
use tower_http::trace::TraceLayer;

pub use self::routes::{status_for, ApiError};

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback() -> (axum::http::StatusCode, &'static str) {
    (axum::http::StatusCode::NOT_FOUND, "not found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::EngineError;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn state() -> AppState {
        let mut config = EngineConfig::default();
        config.storage.journal_path = None;
        AppState::from_config(config).unwrap()
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(b) => Body::from(b.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(router(state()), "GET", "/api/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ok");
        assert_eq!(body["data"]["store"]["events"], 0);
    }

    #[tokio::test]
    async fn test_ingest_then_query() {
        let state = state();
        let events = json!([
            { "timestamp": "2024-03-01T00:00:10Z", "entity": "F1", "level": "Error", "message": "boom" },
            { "timestamp": "2024-03-01T00:00:20Z", "entity": "F2", "message": "ok" },
            { "entity": "F3" }
        ]);
        let (status, body) = call(router(state.clone()), "POST", "/api/v1/events", Some(events)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["ids"].as_array().unwrap().len(), 2);
        assert_eq!(body["data"]["errors"][0]["index"], 2);

        let query = json!({
            "range": { "start": "2024-03-01T00:00:00Z", "end": "2024-03-01T01:00:00Z" },
            "pipeline": { "stages": [
                { "stage": "filter", "predicate": { "op": "eq", "field": "level", "value": "Error" } },
                { "stage": "project", "fields": ["entity", "message"] }
            ] }
        });
        let (status, body) = call(router(state), "POST", "/api/v1/query", Some(query)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["kind"], "rows");
        assert_eq!(body["data"]["data"][0]["entity"], "F1");
        assert_eq!(body["meta"]["rows"], 1);
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let bad_range = json!({
            "range": { "start": "2024-03-01T01:00:00Z", "end": "2024-03-01T00:00:00Z" },
            "pipeline": { "stages": [] }
        });
        let (status, _) = call(router(state()), "POST", "/api/v1/query", Some(bad_range)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let undefined = json!({
            "range": { "start": "2024-03-01T00:00:00Z", "end": "2024-03-01T01:00:00Z" },
            "pipeline": { "stages": [ { "stage": "order_by", "field": "nope" } ] }
        });
        let (status, body) = call(router(state()), "POST", "/api/v1/query", Some(undefined)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]["message"].as_str().unwrap().contains("stage 0"));

        let (status, _) = call(router(state()), "GET", "/nowhere", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        assert_eq!(status_for(&EngineError::Timeout { elapsed_ms: 5 }), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(&EngineError::Cancelled), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_rules_and_alerts_listing() {
        let (status, body) = call(router(state()), "GET", "/api/v1/rules", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meta"]["total"], 0);

        let (status, body) = call(router(state()), "GET", "/api/v1/alerts?limit=5", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!([]));
    }
}
