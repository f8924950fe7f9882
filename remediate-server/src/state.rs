//! Shared application state for the server.

use std::path::PathBuf;
use std::sync::Arc;

use remediate::io::paths::RemediatePaths;
use tokio::sync::broadcast;

/// Events broadcast to SSE clients when files under `.remediate/` change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// `workflows/<id>/state.json` was rewritten.
    WorkflowChanged { workflow_id: String },
    /// A cycle journal entry was written.
    CycleRecorded { workflow_id: String, iter: u32 },
    /// A notice landed in `workflows/<id>/notifications/`.
    NotificationAdded { workflow_id: String, key: String },
    ConfigChanged,
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// `.remediate/` layout of the served project.
    pub paths: RemediatePaths,
    /// Broadcast sender for file change events.
    pub event_tx: Arc<broadcast::Sender<ChangeEvent>>,
}

impl AppState {
    pub fn new(project_dir: PathBuf) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            paths: RemediatePaths::new(project_dir),
            event_tx: Arc::new(event_tx),
        }
    }
}
