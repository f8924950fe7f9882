//! Scripted collaborators and fixtures for workflow tests.
//!
//! Every scripted collaborator counts its calls so tests can assert how many
//! times a stage ran (for example "exactly one apply, zero gate entries").

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;

use crate::core::types::{
    ApplyResult, ChangeProposal, Finding, FindingSet, Location, Severity, Subject,
    SubjectSnapshot, TargetApplyResult, TargetChange, ValidationResult,
};
use crate::io::agent::{AgentRunner, AgentTask};
use crate::workflow::collaborators::{
    Analyzer, Applier, Collaborators, Notice, NoticeKind, Notifier, Proposer, Validator,
};
use crate::workflow::error::InputError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Agent that answers each task from a queue of canned JSON responses.
///
/// The last response for a task is repeated once the queue is drained.
#[derive(Default)]
pub struct ScriptedAgent {
    responses: Mutex<BTreeMap<&'static str, VecDeque<Value>>>,
    prompts: Mutex<BTreeMap<&'static str, Vec<String>>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, task: AgentTask, response: Value) -> Self {
        lock(&self.responses)
            .entry(task.as_str())
            .or_default()
            .push_back(response);
        self
    }

    pub fn calls(&self, task: AgentTask) -> usize {
        lock(&self.prompts).get(task.as_str()).map_or(0, Vec::len)
    }

    pub fn last_prompt(&self, task: AgentTask) -> Option<String> {
        lock(&self.prompts)
            .get(task.as_str())
            .and_then(|prompts| prompts.last().cloned())
    }
}

#[async_trait]
impl AgentRunner for ScriptedAgent {
    async fn run(&self, task: AgentTask, prompt: &str) -> Result<Value> {
        lock(&self.prompts)
            .entry(task.as_str())
            .or_default()
            .push(prompt.to_string());
        let mut responses = lock(&self.responses);
        let queue = responses
            .get_mut(task.as_str())
            .ok_or_else(|| anyhow!("no scripted response for {}", task.as_str()))?;
        let response = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        response.ok_or_else(|| anyhow!("no scripted response for {}", task.as_str()))
    }
}

/// One error-level finding located in `path`.
pub fn finding(path: &str, description: &str) -> Finding {
    Finding {
        kind: "lint".to_string(),
        description: description.to_string(),
        location: Some(Location {
            path: path.to_string(),
            line: Some(1),
            column: None,
        }),
        severity: Severity::Error,
    }
}

/// Analyzer returning a fixed finding set, optionally failing first.
pub struct ScriptedAnalyzer {
    findings: FindingSet,
    /// When set, snapshot contents are re-read from this root on every call.
    live_root: Option<PathBuf>,
    transient_failures: AtomicU32,
    input_error: bool,
    calls: AtomicU32,
}

impl ScriptedAnalyzer {
    /// Reports one finding against `path`, whose current content is `content`.
    pub fn with_finding(path: &str, content: &str) -> Self {
        Self::from_set(FindingSet {
            findings: vec![finding(path, "needs fixing")],
            snapshot: SubjectSnapshot::single(path, content),
        })
    }

    /// Reports one finding against `path` and snapshots its content as it is on
    /// disk under `root` at analysis time.
    pub fn reading(root: &Path, path: &str) -> Self {
        Self {
            live_root: Some(root.to_path_buf()),
            ..Self::with_finding(path, "")
        }
    }

    /// Reports nothing.
    pub fn clean() -> Self {
        Self::from_set(FindingSet::default())
    }

    /// Fails every call with an input error.
    pub fn unreadable() -> Self {
        Self {
            input_error: true,
            ..Self::clean()
        }
    }

    fn from_set(findings: FindingSet) -> Self {
        Self {
            findings,
            live_root: None,
            transient_failures: AtomicU32::new(0),
            input_error: false,
            calls: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` calls with a transient error.
    pub fn failing_first(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    async fn analyze(&self, _subject: &Subject, _hint: Option<&str>) -> Result<FindingSet> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.input_error {
            return Err(InputError::new("cannot read subject").into());
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("analyzer unavailable"));
        }
        let mut findings = self.findings.clone();
        if let Some(root) = &self.live_root {
            for (rel, content) in &mut findings.snapshot.targets {
                *content = std::fs::read_to_string(root.join(rel)).unwrap_or_default();
            }
        }
        Ok(findings)
    }
}

/// Proposer that replaces every snapshot target with fixed content.
pub struct ScriptedProposer {
    new_content: Option<String>,
    calls: AtomicU32,
}

impl ScriptedProposer {
    pub fn replacing(new_content: &str) -> Self {
        Self {
            new_content: Some(new_content.to_string()),
            calls: AtomicU32::new(0),
        }
    }

    /// Proposes the current content back, which yields no changes.
    pub fn unchanged() -> Self {
        Self {
            new_content: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Proposer for ScriptedProposer {
    async fn propose(
        &self,
        _findings: &FindingSet,
        current: &SubjectSnapshot,
    ) -> Result<ChangeProposal> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let targets = current
            .targets
            .iter()
            .map(|(path, content)| {
                (
                    path.clone(),
                    TargetChange {
                        current: content.clone(),
                        new: self.new_content.clone().unwrap_or_else(|| content.clone()),
                        diffs: Vec::new(),
                        executable: false,
                    },
                )
            })
            .collect();
        Ok(ChangeProposal::new("scripted fix", targets))
    }
}

/// Applier that records proposals without touching the filesystem.
#[derive(Default)]
pub struct RecordingApplier {
    applied: Mutex<Vec<String>>,
    fail_targets: Vec<String>,
}

impl RecordingApplier {
    /// Report `targets` as failed writes.
    pub fn failing_targets(targets: &[&str]) -> Self {
        Self {
            applied: Mutex::default(),
            fail_targets: targets.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn calls(&self) -> usize {
        lock(&self.applied).len()
    }

    /// Ids of the proposals applied, in call order.
    pub fn proposal_ids(&self) -> Vec<String> {
        lock(&self.applied).clone()
    }
}

#[async_trait]
impl Applier for RecordingApplier {
    async fn apply(&self, proposal: &ChangeProposal, _subject: &Subject) -> Result<ApplyResult> {
        lock(&self.applied).push(proposal.id().to_string());
        let targets = proposal
            .target_paths()
            .into_iter()
            .map(|target| {
                let success = !self.fail_targets.iter().any(|t| t == target);
                TargetApplyResult {
                    target: target.to_string(),
                    success,
                    message: if success { "applied" } else { "disk full" }.to_string(),
                    backup: None,
                }
            })
            .collect();
        Ok(ApplyResult {
            proposal_id: proposal.id().to_string(),
            targets,
        })
    }
}

/// Validator returning a fixed result.
pub struct ScriptedValidator {
    result: ValidationResult,
    calls: AtomicU32,
}

impl ScriptedValidator {
    pub fn passing() -> Self {
        Self {
            result: ValidationResult::passed(Vec::new()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing(error: &str) -> Self {
        Self {
            result: ValidationResult::failed(error),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Validator for ScriptedValidator {
    async fn validate(&self, _subject: &Subject) -> Result<ValidationResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.result.clone())
    }
}

/// Notifier that keeps every notice in memory.
#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    /// Approval requests sent so far.
    pub fn count(&self) -> usize {
        self.count_kind(NoticeKind::ApprovalRequest)
    }

    pub fn count_kind(&self, kind: NoticeKind) -> usize {
        lock(&self.notices).iter().filter(|n| n.kind == kind).count()
    }

    pub fn notices(&self) -> Vec<Notice> {
        lock(&self.notices).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: &Notice) -> Result<()> {
        lock(&self.notices).push(notice.clone());
        Ok(())
    }
}

/// Typed handles to the scripted collaborators behind a [`Collaborators`] set.
pub struct Scripted {
    pub analyzer: Arc<ScriptedAnalyzer>,
    pub proposer: Arc<ScriptedProposer>,
    pub applier: Arc<RecordingApplier>,
    pub validator: Arc<ScriptedValidator>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Scripted {
    /// A file with one finding, fixed by replacing it with `fixed`, validating cleanly.
    pub fn fixing(path: &str, current: &str, fixed: &str) -> Self {
        Self {
            analyzer: Arc::new(ScriptedAnalyzer::with_finding(path, current)),
            proposer: Arc::new(ScriptedProposer::replacing(fixed)),
            applier: Arc::new(RecordingApplier::default()),
            validator: Arc::new(ScriptedValidator::passing()),
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    pub fn with_analyzer(mut self, analyzer: ScriptedAnalyzer) -> Self {
        self.analyzer = Arc::new(analyzer);
        self
    }

    pub fn with_proposer(mut self, proposer: ScriptedProposer) -> Self {
        self.proposer = Arc::new(proposer);
        self
    }

    pub fn with_applier(mut self, applier: RecordingApplier) -> Self {
        self.applier = Arc::new(applier);
        self
    }

    pub fn with_validator(mut self, validator: ScriptedValidator) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            analyzer: self.analyzer.clone(),
            proposer: self.proposer.clone(),
            applier: self.applier.clone(),
            validator: self.validator.clone(),
            notifier: self.notifier.clone(),
        }
    }
}

/// Temporary repository containing `files` (relative path, content).
pub fn temp_repo(files: &[(&str, &str)]) -> tempfile::TempDir {
    let temp = tempfile::tempdir().unwrap_or_else(|err| panic!("create tempdir: {err}"));
    for (rel, contents) in files {
        write_file(temp.path(), rel, contents);
    }
    temp
}

pub fn write_file(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .unwrap_or_else(|err| panic!("create {}: {err}", parent.display()));
    }
    std::fs::write(&path, contents).unwrap_or_else(|err| panic!("write {}: {err}", path.display()));
}
