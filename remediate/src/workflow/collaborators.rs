//! Collaborator abstractions the pipeline is parameterized by.
//!
//! The workflow never analyzes, writes files or talks to a notification channel
//! itself. Production implementations live in [`crate::io`]; tests use scripted
//! implementations from `test_support`.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{
    ApplyResult, ChangeProposal, FindingSet, Subject, SubjectSnapshot, ValidationResult,
};

#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Produce findings for `subject`. An unreadable subject is an `InputError`.
    async fn analyze(&self, subject: &Subject, hint: Option<&str>) -> Result<FindingSet>;
}

#[async_trait]
pub trait Proposer: Send + Sync {
    async fn propose(
        &self,
        findings: &FindingSet,
        current: &SubjectSnapshot,
    ) -> Result<ChangeProposal>;
}

#[async_trait]
pub trait Applier: Send + Sync {
    /// Apply every target of `proposal`. Must be safe to re-invoke with the same proposal.
    ///
    /// Per-target failures are reported in the result; `Err` means the apply
    /// could not run at all.
    async fn apply(&self, proposal: &ChangeProposal, subject: &Subject) -> Result<ApplyResult>;
}

#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, subject: &Subject) -> Result<ValidationResult>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    ApprovalRequest,
    CycleReport,
}

/// A message for the notification channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub workflow_id: String,
    /// Gate id for approval requests, `<workflow>-<iteration>-report` for reports.
    pub key: String,
    pub message: String,
    #[serde(default)]
    pub payload: Value,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &Notice) -> Result<()>;
}

/// The full set of collaborators one workflow instance runs with.
#[derive(Clone)]
pub struct Collaborators {
    pub analyzer: Arc<dyn Analyzer>,
    pub proposer: Arc<dyn Proposer>,
    pub applier: Arc<dyn Applier>,
    pub validator: Arc<dyn Validator>,
    pub notifier: Arc<dyn Notifier>,
}
