//! Workflow state storage (`.remediate/workflows/<id>/state.json`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::state::WorkflowState;
use crate::io::atomic::{read_json, write_json};

/// Load a workflow state, or `None` if the workflow never checkpointed.
pub fn load_workflow_state(path: &Path) -> Result<Option<WorkflowState>> {
    if !path.exists() {
        return Ok(None);
    }
    debug!(path = %path.display(), "loading workflow state");
    let state: WorkflowState =
        read_json(path).with_context(|| format!("load workflow state {}", path.display()))?;
    debug!(
        workflow_id = %state.workflow_id,
        stage = state.stage.as_str(),
        iteration = state.iteration,
        "workflow state loaded"
    );
    Ok(Some(state))
}

/// Atomically write a workflow state.
pub fn write_workflow_state(path: &Path, state: &WorkflowState) -> Result<()> {
    debug!(
        path = %path.display(),
        stage = state.stage.as_str(),
        iteration = state.iteration,
        "writing workflow state"
    );
    write_json(path, state)
}

/// Every workflow under `workflows_dir`, ordered by id. Unreadable states are skipped.
pub fn list_workflows(workflows_dir: &Path) -> Result<Vec<WorkflowState>> {
    if !workflows_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut states = Vec::new();
    let entries = fs::read_dir(workflows_dir)
        .with_context(|| format!("read {}", workflows_dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", workflows_dir.display()))?;
        let state_path = entry.path().join("state.json");
        match load_workflow_state(&state_path) {
            Ok(Some(state)) => states.push(state),
            Ok(None) => {}
            Err(err) => warn!(path = %state_path.display(), err = %format!("{err:#}"), "skipping unreadable workflow state"),
        }
    }
    states.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
    Ok(states)
}
