//! Collaborators for the single-file fix variant.
//!
//! Analysis combines the configured lint command with an optional agent
//! review; the fix itself is always proposed by the agent as full replacement
//! content for the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{
    ChangeProposal, Finding, FindingSet, ItemDiff, Location, Severity, Subject, SubjectSnapshot,
    TargetChange, ValidationResult,
};
use crate::io::agent::{AgentRunner, AgentTask, run_agent};
use crate::io::config::CheckConfig;
use crate::io::diagnostics::parse_diagnostics;
use crate::io::paths::resolve_target;
use crate::io::process::{CommandOutput, ProcessRequest, run_argv};
use crate::io::prompt::PromptEngine;
use crate::workflow::collaborators::{Analyzer, Proposer, Validator};
use crate::workflow::error::InputError;

#[derive(Debug, Deserialize)]
struct AnalysisOutput {
    issues: Vec<AgentIssue>,
}

#[derive(Debug, Deserialize)]
struct AgentIssue {
    #[serde(rename = "type")]
    kind: String,
    description: String,
    line: Option<u32>,
    column: Option<u32>,
    severity: Severity,
}

#[derive(Debug, Deserialize)]
struct FixOutput {
    fixed_code: String,
    explanation: String,
    changes: Vec<LineChange>,
}

#[derive(Debug, Deserialize)]
struct LineChange {
    line: u32,
    description: String,
}

/// Path of a file subject, or an input error for any other subject.
fn file_path(subject: &Subject) -> Result<&str> {
    match subject {
        Subject::File { path } => Ok(path.as_str()),
        other => Err(InputError::new(format!(
            "file collaborators cannot handle subject {}",
            other.locator()
        ))
        .into()),
    }
}

/// `root` with symlinks and relative components resolved, so tool output that
/// prints absolute paths can be matched back to repository paths.
fn canonical_root(root: PathBuf) -> PathBuf {
    match root.canonicalize() {
        Ok(canonical) => canonical,
        Err(err) => {
            warn!(root = %root.display(), err = %err, "cannot canonicalize root");
            root
        }
    }
}

fn resolve(root: &Path, path: &str) -> Result<PathBuf> {
    resolve_target(root, path).ok_or_else(|| {
        InputError::new(format!("'{path}' is not a path inside the repository")).into()
    })
}

/// Run a check command with `path` appended.
async fn run_check(root: &Path, checks: &CheckConfig, command: &[String], path: &str) -> Result<CommandOutput> {
    let mut argv = command.to_vec();
    argv.push(path.to_string());
    run_argv(ProcessRequest {
        argv,
        workdir: root.to_path_buf(),
        stdin: None,
        timeout: Duration::from_secs(checks.timeout_secs),
        output_limit_bytes: checks.output_limit_bytes,
    })
    .await
}

/// Reads the file, runs the lint command and optionally asks the agent for more.
pub struct FileAnalyzer {
    root: PathBuf,
    checks: CheckConfig,
    agent: Option<Arc<dyn AgentRunner>>,
}

impl FileAnalyzer {
    pub fn new(root: impl Into<PathBuf>, checks: CheckConfig) -> Self {
        Self {
            root: canonical_root(root.into()),
            checks,
            agent: None,
        }
    }

    /// Also ask `agent` to review the file.
    pub fn with_agent(mut self, agent: Arc<dyn AgentRunner>) -> Self {
        self.agent = Some(agent);
        self
    }
}

#[async_trait]
impl Analyzer for FileAnalyzer {
    #[instrument(skip_all, fields(subject = %subject.locator()))]
    async fn analyze(&self, subject: &Subject, hint: Option<&str>) -> Result<FindingSet> {
        let path = file_path(subject)?;
        let full = resolve(&self.root, path)?;
        let content = tokio::fs::read_to_string(&full)
            .await
            .map_err(|err| InputError::new(format!("cannot read {}: {err}", full.display())))?;

        let lint = run_check(&self.root, &self.checks, &self.checks.lint_command, path).await?;
        let mut findings = parse_diagnostics(&lint.combined_text(), &self.root);
        debug!(lint_findings = findings.len(), exit_code = ?lint.status.code(), "lint finished");

        if let Some(agent) = &self.agent {
            let prompt = PromptEngine::new()?.file_analysis(path, &content, hint, &findings)?;
            let output: AnalysisOutput =
                run_agent(agent.as_ref(), AgentTask::FileAnalysis, &prompt).await?;
            findings.extend(output.issues.into_iter().map(|issue| Finding {
                kind: issue.kind,
                description: issue.description,
                location: Some(Location {
                    path: path.to_string(),
                    line: issue.line,
                    column: issue.column,
                }),
                severity: issue.severity,
            }));
        }

        info!(findings = findings.len(), "file analyzed");
        Ok(FindingSet {
            findings,
            snapshot: SubjectSnapshot::single(path, content),
        })
    }
}

/// Asks the agent for a fixed version of every file in the snapshot.
pub struct FileFixProposer {
    agent: Arc<dyn AgentRunner>,
}

impl FileFixProposer {
    pub fn new(agent: Arc<dyn AgentRunner>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Proposer for FileFixProposer {
    #[instrument(skip_all, fields(findings = findings.findings.len()))]
    async fn propose(
        &self,
        findings: &FindingSet,
        current: &SubjectSnapshot,
    ) -> Result<ChangeProposal> {
        let engine = PromptEngine::new()?;
        let mut targets = BTreeMap::new();
        let mut explanations = Vec::new();
        // Findings located outside every target still apply to the subject as a whole.
        let unplaced = |f: &Finding| {
            f.location
                .as_ref()
                .is_none_or(|l| !current.targets.contains_key(&l.path))
        };
        let unplaced_count = findings.findings.iter().filter(|f| unplaced(*f)).count();
        if unplaced_count > 0 {
            debug!(unplaced = unplaced_count, "findings without a matching target go to every target");
        }
        for (path, content) in &current.targets {
            let issues: Vec<Finding> = findings
                .findings
                .iter()
                .filter(|f| unplaced(*f) || f.location.as_ref().is_some_and(|l| &l.path == path))
                .cloned()
                .collect();
            if issues.is_empty() {
                continue;
            }
            let prompt = engine.file_fix(path, content, &issues)?;
            let fix: FixOutput = run_agent(self.agent.as_ref(), AgentTask::FileFix, &prompt).await?;
            let diffs = fix
                .changes
                .into_iter()
                .map(|change| ItemDiff {
                    path: format!("line {}", change.line),
                    old_value: None,
                    new_value: None,
                    rationale: change.description,
                })
                .collect();
            explanations.push(fix.explanation);
            targets.insert(
                path.clone(),
                TargetChange {
                    current: content.clone(),
                    new: fix.fixed_code,
                    diffs,
                    executable: false,
                },
            );
        }
        Ok(ChangeProposal::new(explanations.join("\n"), targets))
    }
}

/// Re-runs the lint command, and the type-check command for configured extensions.
pub struct CommandValidator {
    root: PathBuf,
    checks: CheckConfig,
}

impl CommandValidator {
    pub fn new(root: impl Into<PathBuf>, checks: CheckConfig) -> Self {
        Self {
            root: canonical_root(root.into()),
            checks,
        }
    }

    fn wants_typecheck(&self, path: &str) -> bool {
        !self.checks.typecheck_command.is_empty()
            && Path::new(path)
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| self.checks.typecheck_extensions.iter().any(|e| e == ext))
    }
}

#[async_trait]
impl Validator for CommandValidator {
    #[instrument(skip_all, fields(subject = %subject.locator()))]
    async fn validate(&self, subject: &Subject) -> Result<ValidationResult> {
        let path = file_path(subject)?;
        let lint = run_check(&self.root, &self.checks, &self.checks.lint_command, path).await?;
        let diagnostics = parse_diagnostics(&lint.combined_text(), &self.root);
        let errors: Vec<&str> = diagnostics
            .iter()
            .filter(|f| f.severity == Severity::Error)
            .map(|f| f.description.as_str())
            .collect();
        if !lint.success() || !errors.is_empty() {
            let detail = if errors.is_empty() {
                lint.combined_text().trim().to_string()
            } else {
                errors.join(", ")
            };
            return Ok(ValidationResult::failed(format!(
                "lint errors remain after fix: {detail}"
            )));
        }

        if self.wants_typecheck(path) {
            let typecheck =
                run_check(&self.root, &self.checks, &self.checks.typecheck_command, path).await?;
            if !typecheck.success() {
                return Ok(ValidationResult::failed(format!(
                    "type check failed: {}",
                    typecheck.combined_text().trim()
                )));
            }
        }

        let warnings = diagnostics
            .iter()
            .filter(|f| f.severity != Severity::Error)
            .map(|f| f.description.clone())
            .collect();
        Ok(ValidationResult::passed(warnings))
    }
}
