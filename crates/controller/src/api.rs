//! HTTP API for sample ingestion, decisions, allocation commits, health checks
//! and Prometheus metrics

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use controller_lib::{
    health::{ComponentStatus, HealthRegistry},
    observability::{ControllerMetrics, StructuredLogger},
    AllocationMap, AllocationState, RawSample, TickOutcome,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: ControllerMetrics,
    pub logger: StructuredLogger,
    pub allocation: Arc<AllocationState>,
    /// Outcome of the most recent control tick
    pub latest: Arc<RwLock<Option<TickOutcome>>>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: ControllerMetrics,
        logger: StructuredLogger,
        allocation: Arc<AllocationState>,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            logger,
            allocation,
            latest: Arc::new(RwLock::new(None)),
        }
    }
}

/// One batch of per-stage samples
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleBatch {
    /// Store epoch read before the samples were taken
    #[serde(default)]
    pub epoch: Option<u64>,
    pub samples: BTreeMap<String, RawSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleReceipt {
    pub accepted: usize,
    pub dropped_stale: usize,
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub changed: bool,
    pub epoch: u64,
}

fn bad_request(message: impl std::fmt::Display) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.to_string() })),
    )
        .into_response()
}

/// Health check response - returns 200 if healthy, 503 if degraded/unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

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
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Ingest one batch of samples
///
/// The whole batch is rejected when it names a stage outside the topology.
/// With an `epoch`, samples taken before the last allocation change are dropped.
async fn post_samples(
    State(state): State<Arc<AppState>>,
    Json(batch): Json<SampleBatch>,
) -> Response {
    let engine = state.allocation.engine();
    if let Some(stage) = batch
        .samples
        .keys()
        .find(|id| !engine.topology().contains(id))
    {
        return bad_request(format!("unknown stage '{}'", stage));
    }

    let store = engine.store();
    let mut accepted = 0;
    let mut dropped_stale = 0;
    for (stage, sample) in batch.samples {
        let result = match batch.epoch {
            Some(epoch) => store.put_for_epoch(epoch, &stage, sample),
            None => store.put(&stage, sample).map(|_| true),
        };
        match result {
            Ok(true) => accepted += 1,
            Ok(false) => dropped_stale += 1,
            Err(e) => return bad_request(e),
        }
    }

    state.metrics.add_samples_ingested(accepted as u64);
    state
        .metrics
        .add_stale_samples_dropped(dropped_stale as u64);
    debug!(accepted, dropped_stale, "Samples ingested");

    Json(SampleReceipt {
        accepted,
        dropped_stale,
        epoch: store.epoch(),
    })
    .into_response()
}

/// Latest tick outcome, 204 before the first tick
async fn get_decision(State(state): State<Arc<AppState>>) -> Response {
    match state.latest.read().await.as_ref() {
        Some(outcome) => Json(outcome.clone()).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn get_allocation(State(state): State<Arc<AppState>>) -> Json<AllocationMap> {
    Json(state.allocation.current().await)
}

/// Notification that the pipeline now runs with the posted allocation
async fn post_allocation(
    State(state): State<Arc<AppState>>,
    Json(allocation): Json<AllocationMap>,
) -> Response {
    let changed = match state.allocation.commit(allocation.clone()).await {
        Ok(changed) => changed,
        Err(e) => {
            warn!(error = %e, "Rejected allocation commit");
            return bad_request(e);
        }
    };

    let epoch = state.allocation.engine().store().epoch();
    if changed {
        state.metrics.inc_history_resets();
        state
            .metrics
            .set_allocated_executors(state.allocation.processing_total(&allocation) as i64);
        state.logger.log_allocation_committed(&allocation, epoch);
    }

    Json(CommitReceipt { changed, epoch }).into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/samples", post(post_samples))
        .route("/v1/decision", get(get_decision))
        .route("/v1/allocation", get(get_allocation).post(post_allocation))
        .with_state(state)
}

/// Keep the latest tick outcome for `GET /v1/decision`
///
/// Returns once the control loop drops its sender.
pub async fn record_outcomes(mut outcomes: mpsc::Receiver<TickOutcome>, state: Arc<AppState>) {
    while let Some(outcome) = outcomes.recv().await {
        debug!(tick = outcome.tick, status = %outcome.status, "Recorded tick outcome");
        *state.latest.write().await = Some(outcome);
    }
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
