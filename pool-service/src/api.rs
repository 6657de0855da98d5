//! HTTP API
//!
//! | Route            | Method | Purpose                                  |
//! |------------------|--------|------------------------------------------|
//! | `/state`         | GET    | Supply, capacity and retained history    |
//! | `/config`        | GET    | Public configuration summary             |
//! | `/health`        | GET    | Liveness and scheduler phase             |
//! | `/telemetry`     | POST   | Push a reading (manual and webhook mode) |
//! | `/audit/verify`  | GET    | Replay the audit chain                   |
//! | `/metrics`       | GET    | Prometheus exposition                    |
//!
//! Anything else falls through to the static dashboard directory when one
//! is configured.

use crate::config::ConfigSummary;
use crate::metrics::Metrics;
use crate::scheduler::{Phase, Scheduler};
use crate::telemetry::{Reading, TelemetryError, TelemetryPort};
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use pool_core::{StateStore, StepTrace};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 8 * 1024;

/// Header carrying the telemetry token
pub const TOKEN_HEADER: &str = "x-pool-token";

/// Process liveness flag, cleared at shutdown
#[derive(Debug)]
pub struct Health {
    healthy: AtomicBool,
}

impl Health {
    /// Healthy flag
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
        }
    }

    /// Whether the process is serving normally
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Report 503 from now on
    pub fn mark_shutting_down(&self) {
        self.healthy.store(false, Ordering::SeqCst);
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handler state
#[derive(Clone, Debug)]
pub struct AppState {
    /// Pool state owner
    pub store: Arc<StateStore>,
    /// Telemetry port (push target)
    pub telemetry: Arc<dyn TelemetryPort>,
    /// Scheduler (phase reporting)
    pub scheduler: Arc<Scheduler>,
    /// Metrics collector
    pub metrics: Arc<Metrics>,
    /// Liveness flag
    pub health: Arc<Health>,
    /// Public configuration
    pub config: Arc<ConfigSummary>,
    /// Telemetry token; `None` disables auth
    pub auth_token: Option<Arc<str>>,
}

/// API errors
#[derive(Debug)]
pub enum ApiError {
    /// Missing or wrong token
    Unauthorized,
    /// Wrong method, or push in a mode without push
    MethodNotAllowed(String),
    /// Body over [`MAX_BODY_BYTES`]
    PayloadTooLarge,
    /// Malformed or invalid input
    BadRequest(String),
    /// Audit chain does not verify
    AuditChainBroken {
        /// Position in retained history of the first bad trace
        index: usize,
        /// Recomputed fingerprint
        expected: String,
        /// Stored fingerprint
        actual: String,
    },
    /// Anything else
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, json!({ "error": "unauthorized" })),
            ApiError::MethodNotAllowed(msg) => {
                (StatusCode::METHOD_NOT_ALLOWED, json!({ "error": msg }))
            }
            ApiError::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                json!({ "error": "request body too large" }),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            ApiError::AuditChainBroken {
                index,
                expected,
                actual,
            } => (
                StatusCode::CONFLICT,
                json!({
                    "error": "audit chain broken",
                    "index": index,
                    "expected": expected,
                    "actual": actual,
                }),
            ),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": msg })),
        };

        (status, Json(body)).into_response()
    }
}

impl From<pool_core::Error> for ApiError {
    fn from(err: pool_core::Error) -> Self {
        match err {
            pool_core::Error::AuditChainBroken {
                index,
                expected,
                actual,
            } => ApiError::AuditChainBroken {
                index,
                expected,
                actual,
            },
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<TelemetryError> for ApiError {
    fn from(err: TelemetryError) -> Self {
        match err {
            TelemetryError::PushUnsupported(_) => ApiError::MethodNotAllowed(err.to_string()),
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

/// GET /state body
#[derive(Debug, Serialize)]
pub struct StateResponse {
    /// Current supply
    pub supply: f64,
    /// Capacity ceiling
    pub capacity: f64,
    /// Most recent trace
    pub latest_trace: Option<StepTrace>,
    /// Retained traces, oldest first
    pub history: Vec<StepTrace>,
}

/// POST /telemetry body
#[derive(Debug, Deserialize)]
pub struct TelemetryInput {
    /// External demand observation
    pub observation: f64,
    /// Transaction volume
    pub volume: f64,
}

/// POST /telemetry success body
#[derive(Debug, Serialize)]
pub struct TelemetryAccepted {
    /// Always "received"
    pub status: &'static str,
    /// Accepted observation
    pub observation: f64,
    /// Accepted volume
    pub volume: f64,
    /// Receipt time
    pub timestamp: DateTime<Utc>,
}

/// Build the router
pub fn router(state: AppState, static_dir: Option<PathBuf>) -> Router {
    let api = Router::new()
        .route("/state", get(get_state))
        .route("/config", get(get_config))
        .route("/health", get(get_health))
        .route(
            "/telemetry",
            post(post_telemetry).fallback(telemetry_method_not_allowed),
        )
        .route("/audit/verify", get(verify_audit))
        .route("/metrics", get(get_metrics))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    match static_dir {
        Some(dir) => api.fallback_service(ServeDir::new(dir)),
        None => api,
    }
}

async fn get_state(State(state): State<AppState>) -> Json<StateResponse> {
    Json(state.store.read(|s| StateResponse {
        supply: s.supply,
        capacity: s.capacity,
        latest_trace: s.latest().cloned(),
        history: s.history.clone(),
    }))
}

async fn get_config(State(state): State<AppState>) -> Json<ConfigSummary> {
    Json(state.config.as_ref().clone())
}

async fn get_health(State(state): State<AppState>) -> Response {
    if !state.health.is_healthy() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "shutting_down" })),
        )
            .into_response();
    }

    let phase = state.scheduler.phase();
    let next_run = match phase {
        Phase::Waiting { next_run } => Some(next_run),
        Phase::Running => None,
    };
    Json(json!({
        "status": "ok",
        "scheduler": phase,
        "next_run": next_run,
    }))
    .into_response()
}

async fn post_telemetry(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<TelemetryAccepted>, ApiError> {
    authorize(state.auth_token.as_deref(), &headers)?;

    if !state.telemetry.accepts_push() {
        return Err(TelemetryError::PushUnsupported(state.telemetry.mode().as_str()).into());
    }

    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge
        } else {
            ApiError::BadRequest(rejection.body_text())
        }
    })?;

    let input: TelemetryInput =
        serde_json::from_slice(&body).map_err(|_| ApiError::BadRequest("invalid JSON".into()))?;
    let reading = Reading::new(input.observation, input.volume)?;
    state.telemetry.push(reading)?;
    state.metrics.record_telemetry_update();

    info!(
        observation = reading.observation,
        volume = reading.volume,
        "Telemetry received"
    );

    Ok(Json(TelemetryAccepted {
        status: "received",
        observation: reading.observation,
        volume: reading.volume,
        timestamp: Utc::now(),
    }))
}

async fn telemetry_method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed("only POST allowed".into())
}

async fn verify_audit(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let (anchor, entries) = state
        .store
        .read(|s| (s.chain_anchor.clone(), s.history.len()));

    match state.store.verify_chain() {
        Ok(head) => Ok(Json(json!({
            "valid": true,
            "head": head,
            "entries": entries,
            "anchor": anchor,
        }))),
        Err(e) => {
            warn!(error = %e, "Audit chain verification failed");
            Err(e.into())
        }
    }
}

async fn get_metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let text = state
        .metrics
        .export()
        .map_err(|e| ApiError::Internal(format!("Failed to export metrics: {}", e)))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], text).into_response())
}

/// Check `X-Pool-Token` or `Authorization: Bearer` against the configured token
fn authorize(expected: Option<&str>, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let presented = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .map(str::trim);

    match presented {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }

    diff == 0
}
