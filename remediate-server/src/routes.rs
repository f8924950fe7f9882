//! HTTP route handlers for the workflow API.
//!
//! Reads go straight to the files a running workflow writes; approve, reject
//! and cancel are posted into the same file inbox the CLI uses.

use std::fs;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use remediate::core::ids::is_safe_id;
use remediate::core::outcome::CycleReport;
use remediate::core::state::WorkflowState;
use remediate::io::inbox::{post_signal, request_cancel};
use remediate::io::journal::{list_cycles, load_cycle};
use remediate::io::paths::WorkflowPaths;
use remediate::io::store::{list_workflows, load_workflow_state};
use remediate::workflow::substrate::ApprovalSignal;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/workflows", get(get_workflows))
        .route("/workflows/{id}", get(get_workflow))
        .route("/workflows/{id}/cycles", get(get_cycles))
        .route("/workflows/{id}/cycles/{iter}", get(get_cycle))
        .route("/workflows/{id}/notifications", get(get_notifications))
        .route("/workflows/{id}/signal", post(post_workflow_signal))
        .route("/workflows/{id}/cancel", post(post_workflow_cancel))
}

async fn health() -> &'static str {
    "ok"
}

fn internal(err: anyhow::Error) -> StatusCode {
    warn!(err = %format!("{err:#}"), "request failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

/// Paths and persisted state of workflow `id`: 400 for a malformed id, 404 if unknown.
fn workflow(state: &AppState, id: &str) -> Result<(WorkflowPaths, WorkflowState), StatusCode> {
    if !is_safe_id(id) {
        return Err(StatusCode::BAD_REQUEST);
    }
    let paths = state.paths.workflow(id);
    let stored = load_workflow_state(&paths.state_path)
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok((paths, stored))
}

/// GET /api/workflows - every workflow state, ordered by id.
async fn get_workflows(
    State(state): State<AppState>,
) -> Result<Json<Vec<WorkflowState>>, StatusCode> {
    list_workflows(&state.paths.workflows_dir)
        .map(Json)
        .map_err(internal)
}

/// GET /api/workflows/{id}
async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowState>, StatusCode> {
    let (_, stored) = workflow(&state, &id)?;
    Ok(Json(stored))
}

#[derive(Serialize)]
struct CyclesResponse {
    workflow_id: String,
    cycles: Vec<u32>,
}

/// GET /api/workflows/{id}/cycles - journaled iterations, ascending.
async fn get_cycles(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CyclesResponse>, StatusCode> {
    let (paths, _) = workflow(&state, &id)?;
    let cycles = list_cycles(&paths.cycles_dir).map_err(internal)?;
    Ok(Json(CyclesResponse {
        workflow_id: id,
        cycles,
    }))
}

/// GET /api/workflows/{id}/cycles/{iter} - the full cycle report.
async fn get_cycle(
    State(state): State<AppState>,
    Path((id, iter)): Path<(String, u32)>,
) -> Result<Json<CycleReport>, StatusCode> {
    let (paths, _) = workflow(&state, &id)?;
    if !list_cycles(&paths.cycles_dir)
        .map_err(internal)?
        .contains(&iter)
    {
        return Err(StatusCode::NOT_FOUND);
    }
    load_cycle(&paths.cycles_dir, iter)
        .map(Json)
        .map_err(internal)
}

/// GET /api/workflows/{id}/notifications - journaled notices, ordered by key.
async fn get_notifications(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Value>>, StatusCode> {
    let (paths, _) = workflow(&state, &id)?;
    if !paths.notifications_dir.is_dir() {
        return Ok(Json(Vec::new()));
    }
    let entries = fs::read_dir(&paths.notifications_dir)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let mut files: Vec<std::path::PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();

    let mut notices = Vec::with_capacity(files.len());
    for path in files {
        notices.push(read_json_value(&path)?);
    }
    Ok(Json(notices))
}

#[derive(Serialize)]
struct Accepted {
    workflow_id: String,
    /// False when the workflow was not waiting for approval; the signal is then
    /// dropped when the next gate opens.
    pending_approval: bool,
}

/// POST /api/workflows/{id}/signal - body `{"approved": bool, "note"?: string}`.
async fn post_workflow_signal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(signal): Json<ApprovalSignal>,
) -> Result<(StatusCode, Json<Accepted>), StatusCode> {
    let (paths, stored) = workflow(&state, &id)?;
    post_signal(&paths.signals_dir, &signal).map_err(internal)?;
    info!(workflow_id = %id, approved = signal.approved, "signal posted");
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            workflow_id: id,
            pending_approval: stored.pending_approval,
        }),
    ))
}

/// POST /api/workflows/{id}/cancel
async fn post_workflow_cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Accepted>), StatusCode> {
    let (paths, stored) = workflow(&state, &id)?;
    request_cancel(&paths.cancel_path).map_err(internal)?;
    info!(workflow_id = %id, "cancellation requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            workflow_id: id,
            pending_approval: stored.pending_approval,
        }),
    ))
}

fn read_json_value(path: &std::path::Path) -> Result<Value, StatusCode> {
    if !path.exists() {
        return Err(StatusCode::NOT_FOUND);
    }
    let contents = fs::read_to_string(path).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let value: Value =
        serde_json::from_str(&contents).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(value)
}
