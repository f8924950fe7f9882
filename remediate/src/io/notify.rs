//! Notifier that journals notices next to the workflow state.
//!
//! Each notice lands in `notifications/<key>.json`. The key is the gate id for
//! approval requests, so delivering the same notice twice rewrites one file.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument};

use crate::core::ids::is_safe_id;
use crate::io::atomic::write_json;
use crate::workflow::collaborators::{Notice, NoticeKind, Notifier};

#[derive(Serialize)]
struct JournaledNotice<'a> {
    #[serde(flatten)]
    notice: &'a Notice,
    written_at: DateTime<Utc>,
}

pub struct JournalNotifier {
    notifications_dir: PathBuf,
    console: bool,
}

impl JournalNotifier {
    pub fn new(notifications_dir: impl Into<PathBuf>) -> Self {
        Self {
            notifications_dir: notifications_dir.into(),
            console: false,
        }
    }

    /// Also print approval requests to stderr for an interactive operator.
    pub fn with_console(mut self, console: bool) -> Self {
        self.console = console;
        self
    }
}

#[async_trait]
impl Notifier for JournalNotifier {
    #[instrument(skip_all, fields(key = %notice.key, kind = ?notice.kind))]
    async fn notify(&self, notice: &Notice) -> Result<()> {
        if !is_safe_id(&notice.key) {
            anyhow::bail!("unsafe notification key '{}'", notice.key);
        }
        let path = self.notifications_dir.join(format!("{}.json", notice.key));
        write_json(
            &path,
            &JournaledNotice {
                notice,
                written_at: Utc::now(),
            },
        )?;
        info!(path = %path.display(), message = %notice.message, "notification written");
        if self.console && notice.kind == NoticeKind::ApprovalRequest {
            eprintln!("{}", notice.message);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    fn notice(key: &str) -> Notice {
        Notice {
            kind: NoticeKind::ApprovalRequest,
            workflow_id: "wf-1".to_string(),
            key: key.to_string(),
            message: "approve?".to_string(),
            payload: json!({ "proposal_id": "p-1" }),
        }
    }

    #[tokio::test]
    async fn writes_notice_under_its_key() {
        let temp = tempfile::tempdir().expect("tempdir");
        let notifier = JournalNotifier::new(temp.path());
        notifier.notify(&notice("wf-1-1-gate")).await.expect("notify");
        notifier.notify(&notice("wf-1-1-gate")).await.expect("notify again");

        let entries: Vec<_> = std::fs::read_dir(temp.path())
            .expect("read dir")
            .collect();
        assert_eq!(entries.len(), 1);
        let written: Value = serde_json::from_str(
            &std::fs::read_to_string(temp.path().join("wf-1-1-gate.json")).expect("read"),
        )
        .expect("json");
        assert_eq!(written["kind"], "approval_request");
        assert_eq!(written["payload"]["proposal_id"], "p-1");
        assert!(written["written_at"].is_string());
    }

    #[tokio::test]
    async fn rejects_path_like_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        let notifier = JournalNotifier::new(temp.path());
        assert!(notifier.notify(&notice("../x")).await.is_err());
    }
}
