//! Server-Sent Events stream and file watcher.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::path::{Component, Path};
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::{AppState, ChangeEvent};

#[derive(Serialize)]
struct SsePayload<'a> {
    #[serde(rename = "type")]
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    workflow_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    iter: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<&'a str>,
}

impl<'a> From<&'a ChangeEvent> for SsePayload<'a> {
    fn from(event: &'a ChangeEvent) -> Self {
        let bare = |event_type| SsePayload {
            event_type,
            workflow_id: None,
            iter: None,
            key: None,
        };
        match event {
            ChangeEvent::WorkflowChanged { workflow_id } => SsePayload {
                workflow_id: Some(workflow_id),
                ..bare("workflow_changed")
            },
            ChangeEvent::CycleRecorded { workflow_id, iter } => SsePayload {
                workflow_id: Some(workflow_id),
                iter: Some(*iter),
                ..bare("cycle_recorded")
            },
            ChangeEvent::NotificationAdded { workflow_id, key } => SsePayload {
                workflow_id: Some(workflow_id),
                key: Some(key),
                ..bare("notification_added")
            },
            ChangeEvent::ConfigChanged => bare("config_changed"),
        }
    }
}

/// SSE endpoint handler.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.event_tx.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(change_event) => {
                    if let Ok(json) = serde_json::to_string(&SsePayload::from(&change_event)) {
                        yield Ok(Event::default().event("change").data(json));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// Start the file watcher in a background task.
pub fn start_file_watcher(state: AppState) {
    tokio::spawn(async move {
        if let Err(e) = run_file_watcher(state).await {
            warn!(error = %e, "file watcher failed");
        }
    });
}

async fn run_file_watcher(state: AppState) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<NotifyEvent>(100);

    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.try_send(event);
            }
        },
        notify::Config::default().with_poll_interval(Duration::from_millis(250)),
    )?;

    let state_dir = &state.paths.state_dir;
    if state_dir.exists() {
        watcher.watch(state_dir, RecursiveMode::Recursive)?;
        info!(path = %state_dir.display(), "watching state directory");
    } else {
        warn!(path = %state_dir.display(), "state directory missing; run `remediate init` and restart");
    }

    // Batch at a fixed interval so a burst of checkpoint writes becomes one event.
    let mut pending_events: Vec<NotifyEvent> = Vec::new();
    let mut flush_tick = tokio::time::interval(Duration::from_millis(250));
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                pending_events.push(event);
            }
            _ = flush_tick.tick() => {
                if pending_events.is_empty() {
                    continue;
                }
                process_events(&state, &pending_events);
                pending_events.clear();
            }
        }
    }
}

/// Translate a batch of filesystem events into de-duplicated change events.
fn process_events(state: &AppState, events: &[NotifyEvent]) {
    let mut changes: BTreeSet<Change> = BTreeSet::new();

    for event in events {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            continue;
        }
        for path in &event.paths {
            if path == &state.paths.config_path {
                changes.insert(Change::Config);
            } else if let Some(change) = classify(&state.paths.workflows_dir, path) {
                changes.insert(change);
            }
        }
    }

    for change in changes {
        let event = change.into_event();
        debug!(event = ?event, "broadcasting change");
        let _ = state.event_tx.send(event);
    }
}

/// Ordered so that a batch reports state before cycles before notifications.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Change {
    Config,
    Workflow(String),
    Cycle(String, u32),
    Notification(String, String),
}

impl Change {
    fn into_event(self) -> ChangeEvent {
        match self {
            Change::Config => ChangeEvent::ConfigChanged,
            Change::Workflow(workflow_id) => ChangeEvent::WorkflowChanged { workflow_id },
            Change::Cycle(workflow_id, iter) => ChangeEvent::CycleRecorded { workflow_id, iter },
            Change::Notification(workflow_id, key) => {
                ChangeEvent::NotificationAdded { workflow_id, key }
            }
        }
    }
}

/// Map a path under `workflows/` to the change it signals.
///
/// Cycles count once `report.json` is written; temp files and the signal
/// inbox are ignored.
fn classify(workflows_dir: &Path, path: &Path) -> Option<Change> {
    let rel = path.strip_prefix(workflows_dir).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .map(|c| match c {
            Component::Normal(name) => name.to_str(),
            _ => None,
        })
        .collect::<Option<_>>()?;

    match parts.as_slice() {
        [id, "state.json"] => Some(Change::Workflow((*id).to_string())),
        [id, "cycles", iter, "report.json"] => {
            Some(Change::Cycle((*id).to_string(), iter.parse().ok()?))
        }
        [id, "notifications", file] => {
            let key = file.strip_suffix(".json")?;
            Some(Change::Notification((*id).to_string(), key.to_string()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modify_event(path: std::path::PathBuf) -> NotifyEvent {
        NotifyEvent {
            kind: EventKind::Modify(notify::event::ModifyKind::Any),
            paths: vec![path],
            attrs: Default::default(),
        }
    }

    fn drain(rx: &mut broadcast::Receiver<ChangeEvent>) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn checkpoint_burst_emits_one_workflow_change() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = AppState::new(temp.path().to_path_buf());
        let mut rx = state.event_tx.subscribe();
        let state_path = state.paths.workflow("wf-1").state_path;

        process_events(
            &state,
            &[modify_event(state_path.clone()), modify_event(state_path)],
        );

        assert_eq!(
            drain(&mut rx),
            vec![ChangeEvent::WorkflowChanged {
                workflow_id: "wf-1".to_string()
            }]
        );
    }

    #[test]
    fn cycle_report_and_notification_are_classified() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = AppState::new(temp.path().to_path_buf());
        let mut rx = state.event_tx.subscribe();
        let paths = state.paths.workflow("wf-1");

        process_events(
            &state,
            &[
                modify_event(paths.notification_path("wf-1-2-gate")),
                modify_event(paths.cycle_dir(2).join("meta.json")),
                modify_event(paths.cycle_dir(2).join("report.json")),
                modify_event(paths.signals_dir.join("0001.json")),
            ],
        );

        assert_eq!(
            drain(&mut rx),
            vec![
                ChangeEvent::CycleRecorded {
                    workflow_id: "wf-1".to_string(),
                    iter: 2
                },
                ChangeEvent::NotificationAdded {
                    workflow_id: "wf-1".to_string(),
                    key: "wf-1-2-gate".to_string()
                },
            ]
        );
    }

    #[test]
    fn payload_carries_only_relevant_fields() {
        let event = ChangeEvent::CycleRecorded {
            workflow_id: "wf-1".to_string(),
            iter: 3,
        };
        let json = serde_json::to_value(SsePayload::from(&event)).expect("json");
        assert_eq!(
            json,
            serde_json::json!({ "type": "cycle_recorded", "workflow_id": "wf-1", "iter": 3 })
        );
    }
}
