// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP API.
//!
//! ## Endpoints
//!
//! - `POST /e/{source_key}` - Ingest one event or an array of events
//! - `GET /health` - Liveness
//! - `PUT /v1/functions` - Sync function definitions
//! - `GET /v1/runs/{run_id}` - Run, stack and trigger events
//! - `POST /v1/runs/{run_id}/cancel` - Cancel a run
//! - `POST /v1/partitions/{fn_id}/drain` - Dead-letter a partition's pending items

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Serialize;
use serde_json::{Value, json};
use steadfast_core::clock::Clock;
use steadfast_core::event::{Event, IngestBody};
use steadfast_core::function::FunctionConfig;
use steadfast_core::id::{EventId, FunctionId, RunId};
use steadfast_core::run::{Run, StackEntry};
use steadfast_core::state::StateStore;
use steadfast_core::{Component, CoreError, Lifecycle};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<Lifecycle>,
    /// Environment ingested events belong to
    pub env_id: Uuid,
}

/// Error body: `{error, code}`.
#[derive(Debug)]
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(CoreError::validation(Component::Api, rejection.body_text()))
    }
}

/// HTTP status for an error code.
pub fn status_for(err: &CoreError) -> StatusCode {
    match err.error_code() {
        "VALIDATION_ERROR" | "COMPILATION_ERROR" | "SERIALIZATION_ERROR" => StatusCode::BAD_REQUEST,
        "NOT_FOUND" => StatusCode::NOT_FOUND,
        "RUN_TERMINAL" | "CONTENTION" => StatusCode::CONFLICT,
        "TRANSIENT_INFRA_ERROR" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        let body = json!({ "error": self.0.to_string(), "code": self.0.error_code() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub ids: Vec<EventId>,
}

#[derive(Debug, Serialize)]
pub struct SyncedFunction {
    pub id: FunctionId,
    pub slug: String,
    pub version: u32,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub functions: Vec<SyncedFunction>,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub run: Run,
    pub stack: Vec<StackEntry>,
    pub events: Vec<Event>,
}

#[derive(Debug, Serialize)]
pub struct DrainResponse {
    pub drained: usize,
}

/// Create the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/e/{source_key}", post(ingest))
        .route("/v1/functions", put(sync_functions))
        .route("/v1/runs/{run_id}", get(get_run))
        .route("/v1/runs/{run_id}/cancel", post(cancel_run))
        .route("/v1/partitions/{fn_id}/drain", post(drain_partition))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Every event is validated before any is ingested.
async fn ingest(
    State(state): State<AppState>,
    Path(source_key): Path<String>,
    body: Result<Json<IngestBody>, JsonRejection>,
) -> ApiResult<IngestResponse> {
    let Json(body) = body?;
    let now = state.lifecycle.clock().now();
    let events = body
        .into_events()
        .into_iter()
        .map(|incoming| Event::ingest(incoming, state.env_id, Some(source_key.clone()), now))
        .collect::<Result<Vec<_>, _>>()?;

    let mut ids = Vec::with_capacity(events.len());
    for event in events {
        let id = event.internal_id;
        let result = state.lifecycle.ingest(event).await?;
        info!(
            event_id = %id,
            runs = result.runs.len(),
            resumed = result.resumed.len(),
            cancelled = result.cancelled.len(),
            "Event ingested"
        );
        ids.push(id);
    }
    Ok(Json(IngestResponse { ids }))
}

async fn sync_functions(
    State(state): State<AppState>,
    body: Result<Json<Vec<FunctionConfig>>, JsonRejection>,
) -> ApiResult<SyncResponse> {
    let Json(configs) = body?;
    let synced = state.lifecycle.sync_functions(state.env_id, configs)?;
    Ok(Json(SyncResponse {
        functions: synced
            .iter()
            .map(|f| SyncedFunction {
                id: f.id,
                slug: f.slug().to_string(),
                version: f.version,
            })
            .collect(),
    }))
}

async fn get_run(State(state): State<AppState>, Path(run_id): Path<String>) -> ApiResult<RunResponse> {
    let run_id: RunId = run_id.parse()?;
    let store = state.lifecycle.state();
    if store.load_run(run_id).await?.is_none() {
        return Err(CoreError::not_found(Component::Api, "run", run_id).into());
    }
    let loaded = store.load(run_id).await?;
    Ok(Json(RunResponse {
        run: loaded.run,
        stack: loaded.stack,
        events: loaded.events,
    }))
}

async fn cancel_run(State(state): State<AppState>, Path(run_id): Path<String>) -> ApiResult<Value> {
    let run_id: RunId = run_id.parse()?;
    state.lifecycle.cancel_run(run_id).await?;
    Ok(Json(json!({ "run_id": run_id, "status": "cancelled" })))
}

async fn drain_partition(
    State(state): State<AppState>,
    Path(fn_id): Path<String>,
) -> ApiResult<DrainResponse> {
    let fn_id: FunctionId = fn_id.parse()?;
    let drained = state.lifecycle.queue().drain(fn_id);
    info!(fn_id = %fn_id, drained, "Partition drained");
    Ok(Json(DrainResponse { drained }))
}
