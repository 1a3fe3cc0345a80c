//! API route definitions.

use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::api::state::AppState;
use crate::error::EngineError;
use crate::event::{EventInput, TimeRange};
use crate::query::{Pipeline, QueryOptions};
use crate::scheduler::DetectionRunner;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/events", post(ingest))
        .route("/query", post(query))
        .route("/detect", post(detect))
        .route("/rules", get(list_rules))
        .route("/alerts", get(list_alerts))
        .route("/detections", get(list_detections))
}

/// Error body plus status code.
pub enum ApiError {
    Engine(EngineError),
    Internal(anyhow::Error),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

pub fn status_for(e: &EngineError) -> StatusCode {
    match e {
        EngineError::Validation(_) | EngineError::InvalidRange { .. } | EngineError::Pipeline { .. } => {
            StatusCode::BAD_REQUEST
        }
        EngineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        EngineError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Engine(e) => (status_for(&e), e.to_string()),
            ApiError::Internal(e) => {
                warn!(error = %e, "internal API error");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(json!({ "error": { "status": status.as_u16(), "message": message } })))
            .into_response()
    }
}

fn meta() -> Value {
    json!({
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "store": state.store.stats(),
        },
        "meta": meta()
    }))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EventBody {
    Many(Vec<EventInput>),
    One(EventInput),
}

async fn ingest(
    State(state): State<AppState>,
    Json(body): Json<EventBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let timeout = state.config.engine.ingest_timeout;
    match body {
        EventBody::One(input) => {
            let id = state.ingestor.submit(input, timeout).await?;
            Ok((
                StatusCode::CREATED,
                Json(json!({ "data": { "ids": [id] }, "meta": meta() })),
            ))
        }
        EventBody::Many(inputs) => {
            let results = state.ingestor.submit_batch(inputs, timeout).await;
            let mut ids = Vec::new();
            let mut errors = Vec::new();
            for (index, r) in results.into_iter().enumerate() {
                match r {
                    Ok(id) => ids.push(id),
                    Err(e) => errors.push(json!({ "index": index, "error": e.to_string() })),
                }
            }
            let status = if errors.is_empty() {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            Ok((
                status,
                Json(json!({
                    "data": { "ids": ids, "errors": errors },
                    "meta": meta()
                })),
            ))
        }
    }
}

#[derive(Deserialize)]
struct QueryRequest {
    pipeline: Pipeline,
    range: TimeRange,
    timeout_ms: Option<u64>,
}

async fn query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<Value>, ApiError> {
    let timeout = req
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(state.config.engine.query_timeout);
    let started = Instant::now();
    let output = state
        .engine()
        .run(req.pipeline, req.range, QueryOptions::with_timeout(timeout))
        .await?;
    Ok(Json(json!({
        "data": output,
        "meta": {
            "rows": output.len(),
            "elapsed_ms": started.elapsed().as_millis() as u64,
            "version": env!("CARGO_PKG_VERSION")
        }
    })))
}

#[derive(Deserialize)]
struct DetectRequest {
    pipeline: Pipeline,
    range: TimeRange,
    metric: String,
    /// Baseline family; derived from the pipeline when absent.
    #[serde(default)]
    source: Option<String>,
}

async fn detect(
    State(state): State<AppState>,
    Json(req): Json<DetectRequest>,
) -> Result<Json<Value>, ApiError> {
    let source = req
        .source
        .unwrap_or_else(|| DetectionRunner::adhoc_source(&req.pipeline));
    let outcome = state
        .runner
        .run(req.pipeline, req.range, &source, &req.metric, Utc::now())
        .await?;
    Ok(Json(json!({
        "data": outcome,
        "meta": { "anomalies": outcome.anomalies(), "version": env!("CARGO_PKG_VERSION") }
    })))
}

async fn list_rules(State(state): State<AppState>) -> Json<Value> {
    let rules: Vec<_> = state.runner.dispatcher.rules().collect();
    Json(json!({ "data": rules, "meta": { "total": rules.len() } }))
}

#[derive(Deserialize)]
struct AlertsParams {
    limit: Option<usize>,
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(params): Query<AlertsParams>,
) -> Result<Json<Value>, ApiError> {
    let alerts = match state.runner.dispatcher.history() {
        Some(history) => history.list_recent(params.limit.unwrap_or(50).min(1000))?,
        None => Vec::new(),
    };
    Ok(Json(json!({ "data": alerts, "meta": { "total": alerts.len() } })))
}

async fn list_detections(State(state): State<AppState>) -> Json<Value> {
    let next = state.scheduler.next_runs();
    let jobs: Vec<Value> = state
        .scheduler
        .jobs()
        .into_iter()
        .map(|job| {
            let next_run = next.get(&job.name).copied().flatten();
            json!({ "job": job, "next_run": next_run })
        })
        .collect();
    Json(json!({
        "data": { "jobs": jobs, "recent_runs": state.scheduler.recent_runs() },
        "meta": meta()
    }))
}
