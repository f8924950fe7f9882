//! Shared deterministic types for the remediation core.
//!
//! These types define the contracts between pipeline stages. They carry no I/O
//! and serialize to stable JSON so they can be checkpointed and replayed.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::categories::ConfigCategory;
use crate::core::ids::content_id;

/// What a workflow remediates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Subject {
    /// A single source file, relative to the repository root.
    File { path: String },
    /// The repository's tooling configuration for the given categories.
    Config { categories: Vec<ConfigCategory> },
}

impl Subject {
    pub fn file(path: impl Into<String>) -> Self {
        Subject::File { path: path.into() }
    }

    /// Config subject with categories sorted and de-duplicated.
    pub fn config(categories: impl IntoIterator<Item = ConfigCategory>) -> Self {
        let mut categories: Vec<ConfigCategory> = categories.into_iter().collect();
        categories.sort();
        categories.dedup();
        Subject::Config { categories }
    }

    /// Stable locator string the workflow id is derived from.
    pub fn locator(&self) -> String {
        match self {
            Subject::File { path } => format!("fix:{path}"),
            Subject::Config { categories } => {
                let names: Vec<&str> = categories.iter().map(|c| c.as_str()).collect();
                format!("audit:{}", names.join(","))
            }
        }
    }
}

/// Severity attached to a finding.
///
/// Config audits speak a different vocabulary (`suggestion`, `recommended`,
/// `critical`); those map onto the same three levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[serde(alias = "suggestion")]
    Info,
    #[serde(alias = "recommended")]
    Warning,
    #[serde(alias = "critical")]
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

/// Position of a finding inside a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

/// A single defect or recommendation produced by analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub severity: Severity,
}

/// Current content of every target the subject covers, keyed by path
/// relative to the repository root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectSnapshot {
    pub targets: BTreeMap<String, String>,
}

impl SubjectSnapshot {
    pub fn single(path: impl Into<String>, content: impl Into<String>) -> Self {
        let mut targets = BTreeMap::new();
        targets.insert(path.into(), content.into());
        Self { targets }
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.targets.get(path).map(String::as_str)
    }
}

/// Output of the analyze stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingSet {
    pub findings: Vec<Finding>,
    pub snapshot: SubjectSnapshot,
}

impl FindingSet {
    pub fn requires_action(&self) -> bool {
        !self.findings.is_empty()
    }

    /// Count findings at or above `severity`.
    pub fn count_at_least(&self, severity: Severity) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity >= severity)
            .count()
    }
}

/// One itemized change inside a target, with the reason it was proposed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDiff {
    /// Line number or dotted key path the change touches.
    pub path: String,
    #[serde(default)]
    pub old_value: Option<Value>,
    #[serde(default)]
    pub new_value: Option<Value>,
    pub rationale: String,
}

/// Full replacement content for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetChange {
    pub current: String,
    pub new: String,
    #[serde(default)]
    pub diffs: Vec<ItemDiff>,
    /// Written with the executable bit set (hook scripts).
    #[serde(default)]
    pub executable: bool,
}

impl TargetChange {
    pub fn is_noop(&self) -> bool {
        self.current == self.new
    }
}

/// Output of the propose stage.
///
/// Only constructed through [`ChangeProposal::new`] / [`ChangeProposal::none`],
/// which drop no-op targets and derive the content-addressed id. A proposal with
/// no targets has no changes and never reaches the gate or the apply stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeProposal {
    id: String,
    summary: String,
    targets: BTreeMap<String, TargetChange>,
}

impl ChangeProposal {
    pub fn new(summary: impl Into<String>, targets: BTreeMap<String, TargetChange>) -> Self {
        let targets: BTreeMap<String, TargetChange> = targets
            .into_iter()
            .filter(|(_, change)| !change.is_noop())
            .collect();
        let id = proposal_id(&targets);
        Self {
            id,
            summary: summary.into(),
            targets,
        }
    }

    pub fn none() -> Self {
        Self::new("no changes", BTreeMap::new())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn targets(&self) -> &BTreeMap<String, TargetChange> {
        &self.targets
    }

    pub fn has_changes(&self) -> bool {
        !self.targets.is_empty()
    }

    pub fn target_paths(&self) -> Vec<&str> {
        self.targets.keys().map(String::as_str).collect()
    }
}

/// Hash of every target's path, pre-apply content and new content.
///
/// The same change proposed against different pre-apply content gets a
/// different id, so each gets its own backup.
fn proposal_id(targets: &BTreeMap<String, TargetChange>) -> String {
    let mut material = String::new();
    for (path, change) in targets {
        material.push_str(path);
        material.push('\0');
        material.push_str(&change.current);
        material.push('\0');
        material.push_str(&change.new);
        material.push('\0');
    }
    format!("p-{}", content_id(&material, 16))
}

/// Tri-state outcome of an approval gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    TimedOut,
}

impl ApprovalDecision {
    pub fn from_signal(approved: bool) -> Self {
        if approved {
            ApprovalDecision::Approved
        } else {
            ApprovalDecision::Rejected
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub decision: ApprovalDecision,
    pub decided_at: DateTime<Utc>,
}

/// Single-slot, overwrite-once holder for a gate decision.
///
/// The first call to [`DecisionSlot::settle`] wins; later calls are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionSlot {
    settled: Option<GateDecision>,
}

impl DecisionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settled(decision: Option<GateDecision>) -> Self {
        Self { settled: decision }
    }

    /// Record `decision` unless one is already present. Returns whether it was recorded.
    pub fn settle(&mut self, decision: GateDecision) -> bool {
        if self.settled.is_some() {
            return false;
        }
        self.settled = Some(decision);
        true
    }

    pub fn get(&self) -> Option<GateDecision> {
        self.settled
    }
}

/// Result of applying one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetApplyResult {
    pub target: String,
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub backup: Option<PathBuf>,
}

/// Output of the apply stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub proposal_id: String,
    pub targets: Vec<TargetApplyResult>,
}

impl ApplyResult {
    pub fn applied(&self) -> impl Iterator<Item = &TargetApplyResult> {
        self.targets.iter().filter(|t| t.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TargetApplyResult> {
        self.targets.iter().filter(|t| !t.success)
    }

    pub fn all_succeeded(&self) -> bool {
        self.targets.iter().all(|t| t.success)
    }
}

/// Output of the validate stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn passed(warnings: Vec<String>) -> Self {
        Self {
            success: true,
            error: None,
            warnings,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            warnings: Vec::new(),
        }
    }
}
