//! Terminal outcomes of a cycle and their user-facing messages.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{
    ApplyResult, ApprovalDecision, ChangeProposal, Finding, ValidationResult,
};

/// How a single cycle ended. Every variant renders exactly one explanatory message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Analysis found nothing that requires action.
    NoIssues,
    /// Findings existed but the proposal contained no changes.
    NoUpdates,
    Applied {
        targets: Vec<String>,
        summary: String,
    },
    /// Some targets were written, others failed; validation still ran and passed.
    PartiallyApplied {
        applied: Vec<String>,
        failed: Vec<String>,
    },
    Rejected,
    TimedOut,
    /// Changes were applied but post-apply checks failed. Changes are left in place.
    ValidationFailed {
        error: String,
        backups: Vec<PathBuf>,
    },
    Cancelled,
    Failed {
        error: String,
    },
}

impl CycleOutcome {
    /// Whether the cycle ended with a degraded, non-fatal result.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            CycleOutcome::ValidationFailed { .. } | CycleOutcome::PartiallyApplied { .. }
        )
    }

    /// Whether the cycle ended without touching the subject because of the gate or cancellation.
    pub fn is_not_applied(&self) -> bool {
        matches!(
            self,
            CycleOutcome::Rejected | CycleOutcome::TimedOut | CycleOutcome::Cancelled
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, CycleOutcome::Failed { .. })
    }

    pub fn message(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleOutcome::NoIssues => f.write_str("No issues found that require fixing."),
            CycleOutcome::NoUpdates => f.write_str("No updates needed at this time."),
            CycleOutcome::Applied { targets, summary } => {
                write!(f, "Successfully applied changes to {}", targets.join(", "))?;
                if !summary.trim().is_empty() {
                    write!(f, ": {}", summary.trim())?;
                }
                Ok(())
            }
            CycleOutcome::PartiallyApplied { applied, failed } => write!(
                f,
                "Applied changes to {} but failed to update {}.",
                list_or_none(applied),
                failed.join(", ")
            ),
            CycleOutcome::Rejected => f.write_str("Changes were rejected; nothing was applied."),
            CycleOutcome::TimedOut => f.write_str(
                "Changes were not approved within the timeout period; nothing was applied.",
            ),
            CycleOutcome::ValidationFailed { error, backups } => {
                write!(
                    f,
                    "Validation failed after applying changes: {error}. Changes were left in place"
                )?;
                if backups.is_empty() {
                    f.write_str(".")
                } else {
                    let shown: Vec<String> =
                        backups.iter().map(|p| p.display().to_string()).collect();
                    write!(f, "; backups: {}.", shown.join(", "))
                }
            }
            CycleOutcome::Cancelled => {
                f.write_str("Workflow cancelled; pending changes were not applied.")
            }
            CycleOutcome::Failed { error } => write!(f, "Error in remediation workflow: {error}"),
        }
    }
}

/// Durable summary of one finished cycle, written to the cycle journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub workflow_id: String,
    pub iteration: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub proposal: Option<ChangeProposal>,
    #[serde(default)]
    pub decision: Option<ApprovalDecision>,
    #[serde(default)]
    pub apply: Option<ApplyResult>,
    #[serde(default)]
    pub validation: Option<ValidationResult>,
    pub outcome: CycleOutcome,
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "no targets".to_string()
    } else {
        items.join(", ")
    }
}
