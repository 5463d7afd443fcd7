//! HTTP API for status, metrics and operator commands
//!
//! - `GET  /health`                   liveness plus uptime
//! - `GET  /metrics`                  Prometheus text format
//! - `GET  /status`                   per-state transfer counts
//! - `GET  /transfers/{hash}`         one transfer
//! - `POST /transfers/{hash}/retry`   re-attempt a failed transfer
//! - `POST /transfers/{hash}/contest` contest a pending withdrawal
//! - `POST /transfers/{hash}/resolve` clear an operator-review flag

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use eyre::eyre;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::engine::{EngineHandle, EngineStatus};
use crate::error::RelayError;
use crate::ledger::LedgerError;
use crate::types::{Transfer, TransferHash};

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub started: Instant,
}

impl AppState {
    pub fn new(engine: EngineHandle) -> Self {
        Self {
            engine,
            started: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Error type of the handlers
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Relay(RelayError),
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        ApiError::Relay(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Relay(e) => match e {
                RelayError::NotFound(_) => StatusCode::NOT_FOUND,
                RelayError::ProtocolViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                RelayError::EngineStopped => StatusCode::SERVICE_UNAVAILABLE,
                RelayError::Ledger(LedgerError::Conflict { .. }) => StatusCode::CONFLICT,
                e if e.is_rejection() => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = match self {
            ApiError::BadRequest(msg) => msg,
            ApiError::Relay(e) => e.to_string(),
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

fn parse_hash(raw: &str) -> Result<TransferHash, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid transfer hash '{}'", raw)))
}

/// Health check endpoint handler
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

pub async fn status(State(state): State<AppState>) -> Json<EngineStatus> {
    Json(state.engine.summary().await)
}

pub async fn get_transfer(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<Transfer>, ApiError> {
    let hash = parse_hash(&hash)?;
    state
        .engine
        .status(&hash)
        .await
        .map(Json)
        .ok_or(ApiError::Relay(RelayError::NotFound(hash)))
}

pub async fn retry_transfer(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<Transfer>, ApiError> {
    let hash = parse_hash(&hash)?;
    info!(transfer_hash = %hash, "Operator retry requested");
    Ok(Json(state.engine.retry(hash).await?))
}

pub async fn contest_transfer(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<Transfer>, ApiError> {
    let hash = parse_hash(&hash)?;
    info!(transfer_hash = %hash, "Contest signal received");
    Ok(Json(state.engine.contest(hash).await?))
}

pub async fn resolve_transfer(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<Transfer>, ApiError> {
    let hash = parse_hash(&hash)?;
    info!(transfer_hash = %hash, "Operator resolve requested");
    Ok(Json(state.engine.resolve(hash).await?))
}

/// Prometheus metrics endpoint
pub async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .route("/status", get(status))
        .route("/transfers/{hash}", get(get_transfer))
        .route("/transfers/{hash}/retry", post(retry_transfer))
        .route("/transfers/{hash}/contest", post(contest_transfer))
        .route("/transfers/{hash}/resolve", post(resolve_transfer))
        .with_state(state)
}

/// Start the HTTP server; returns when `shutdown` flips to true
pub async fn start_server(
    bind_address: &str,
    port: u16,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> eyre::Result<()> {
    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}:{}: {}", bind_address, port, e))?;
    info!("API server listening on {}", addr);
    info!("  /health  - Liveness (JSON)");
    info!("  /metrics - Prometheus metrics");
    info!("  /status  - Transfer counts by state");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    Ok(())
}
