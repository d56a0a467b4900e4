//! API request handlers

use super::ApiError;
use crate::config::{ConfigError, Settings};
use crate::dispatch::{Dispatcher, SubmitError, SubmitOutcome, SubmitRequest};
use crate::metrics::GatewayMetrics;
use crate::store::StateStore;
use crate::types::ShuttleCommand;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

/// Shared state for all API handlers.
#[derive(Clone)]
pub struct GatewayApiState {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn StateStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<GatewayMetrics>,
}

/// Body of `POST /api/v1/command`.
#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub shuttle_id: String,
    pub command: ShuttleCommand,
    pub params: Option<String>,
    pub external_id: Option<String>,
    pub priority: Option<i32>,
    pub document_type: Option<String>,
}

/// Submit a command for a shuttle.
pub async fn submit_command(
    State(state): State<GatewayApiState>,
    Json(body): Json<CommandRequest>,
) -> Result<Json<Value>, ApiError> {
    // HOME defaults to elevated urgency when the caller has no opinion
    let priority = body
        .priority
        .or_else(|| (body.command == ShuttleCommand::Home).then_some(5));

    let request = SubmitRequest {
        shuttle_id: body.shuttle_id,
        command: body.command,
        params: body.params,
        external_id: body.external_id,
        priority,
        document_type: body.document_type,
    };

    match state.dispatcher.submit(request).await {
        Ok(SubmitOutcome::Queued(command_id)) => Ok(Json(json!({
            "status": "queued",
            "command_id": command_id,
        }))),
        Ok(SubmitOutcome::Executed) => Ok(Json(json!({ "status": "executed" }))),
        Err(e @ SubmitError::UnknownShuttle(_)) => Err(ApiError::not_found(e.to_string())),
        Err(e @ SubmitError::BadParams { .. }) => Err(ApiError::bad_request(e.to_string())),
        Err(e @ SubmitError::QueueFull(_)) => Err(ApiError::service_unavailable(e.to_string())),
        Err(e @ SubmitError::Busy(_)) => Err(ApiError::conflict(e.to_string())),
        Err(e @ SubmitError::Send(_)) => Err(ApiError::bad_gateway(e.to_string())),
        Err(e @ SubmitError::Store(_)) => Err(ApiError::service_unavailable(e.to_string())),
    }
}

/// Best-effort cancellation of a queued command.
pub async fn cancel_command(
    State(state): State<GatewayApiState>,
    Path(command_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.dispatcher.cancel(&command_id).await {
        info!(command_id, "Command cancelled via API");
        Ok(Json(json!({ "status": "cancelled", "command_id": command_id })))
    } else {
        Err(ApiError::not_found(format!(
            "command {command_id} not found or no longer cancellable"
        )))
    }
}

/// All shuttle state records.
pub async fn list_shuttles(
    State(state): State<GatewayApiState>,
) -> Result<Json<Value>, ApiError> {
    let states = state
        .store
        .all_states()
        .map_err(|e| ApiError::service_unavailable(e.to_string()))?;
    Ok(Json(json!({ "shuttles": states })))
}

/// One shuttle state record.
pub async fn get_shuttle(
    State(state): State<GatewayApiState>,
    Path(shuttle_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .store
        .get(&shuttle_id)
        .map_err(|e| ApiError::service_unavailable(e.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("shuttle {shuttle_id} not found")))?;
    Ok(Json(serde_json::to_value(record).map_err(|e| ApiError::internal(e.to_string()))?))
}

/// Body of `POST /api/v1/stocks/move`.
#[derive(Debug, Deserialize)]
pub struct MoveShuttleRequest {
    pub shuttle_id: String,
    pub to_stock: String,
}

/// Remap a shuttle to another stock; rewrites the seed file.
pub async fn move_shuttle_stock(
    State(state): State<GatewayApiState>,
    Json(body): Json<MoveShuttleRequest>,
) -> Result<Json<Value>, ApiError> {
    match state.settings.move_shuttle(&body.shuttle_id, &body.to_stock) {
        Ok(()) => Ok(Json(json!({
            "status": "moved",
            "shuttle_id": body.shuttle_id,
            "stock": body.to_stock,
        }))),
        Err(e @ ConfigError::UnknownShuttle(_)) => Err(ApiError::not_found(e.to_string())),
        Err(e) => Err(ApiError::internal(e.to_string())),
    }
}

/// Metrics snapshot for the WMS-side monitoring sink.
pub async fn get_metrics(State(state): State<GatewayApiState>) -> Json<Value> {
    Json(json!(state.metrics.snapshot()))
}

/// Liveness probe.
pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
