//! One remediation cycle: analyze → propose → gate → apply → validate → report.
//!
//! Every collaborator call goes through [`run_activity`] and the workflow state
//! is checkpointed after each stage transition, so [`CycleRunner::run`] can be
//! entered again at the stage a previous process stopped in.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::core::outcome::{CycleOutcome, CycleReport};
use crate::core::retry::RetryPolicy;
use crate::core::state::{Stage, WorkflowState};
use crate::core::trigger::TriggerSpec;
use crate::core::types::{
    ApplyResult, ApprovalDecision, ChangeProposal, FindingSet, Subject, ValidationResult,
};
use crate::workflow::activity::run_activity;
use crate::workflow::collaborators::{Collaborators, Notice, NoticeKind};
use crate::workflow::error::is_cancelled;
use crate::workflow::gate::{GateRequest, await_approval};
use crate::workflow::substrate::Substrate;

/// Where [`CycleRunner::run`] picks a cycle up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEntry {
    /// State is in `Analyzing` with a fresh checkpoint.
    Analyze,
    Gate,
    Apply,
    Validate,
    Report,
}

/// Tunables shared by every cycle of a workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
    /// Send a cycle report through the notifier after each cycle.
    pub notify_final: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(1),
            notify_final: true,
        }
    }
}

/// Borrowed view of everything a cycle needs.
pub struct CycleRunner<'a, S: Substrate + ?Sized> {
    pub substrate: &'a S,
    pub collaborators: &'a Collaborators,
    pub subject: &'a Subject,
    pub trigger: &'a TriggerSpec,
    pub settings: &'a PipelineSettings,
}

impl<S: Substrate + ?Sized> CycleRunner<'_, S> {
    /// Drive the current cycle of `state` from `entry` to `Reporting`.
    ///
    /// On success `state` is in `Reporting` with the outcome checkpointed and the
    /// cycle journaled. Errors leave `state` at the stage that failed.
    #[instrument(skip_all, fields(workflow_id = %state.workflow_id, iteration = state.iteration, entry = ?entry))]
    pub async fn run(&self, state: &mut WorkflowState, entry: CycleEntry) -> Result<CycleOutcome> {
        let outcome = match entry {
            CycleEntry::Analyze => self.from_analyze(state).await?,
            CycleEntry::Gate => {
                let proposal = checkpointed_proposal(state)?;
                self.from_gate(state, proposal).await?
            }
            CycleEntry::Apply => {
                let proposal = checkpointed_proposal(state)?;
                self.from_apply(state, &proposal).await?
            }
            CycleEntry::Validate => {
                let apply = state
                    .checkpoint
                    .as_ref()
                    .and_then(|c| c.apply.clone())
                    .context("validate resume without checkpointed apply result")?;
                let proposal = checkpointed_proposal(state)?;
                self.from_validate(state, &proposal, &apply).await?
            }
            CycleEntry::Report => state
                .checkpoint
                .as_ref()
                .and_then(|c| c.outcome.clone())
                .context("report resume without checkpointed outcome")?,
        };
        self.report(state, outcome).await
    }

    async fn from_analyze(&self, state: &mut WorkflowState) -> Result<CycleOutcome> {
        let hint = self.trigger.hint.as_deref();
        let analyzer = &self.collaborators.analyzer;
        let findings: FindingSet = run_activity(self.substrate, "analyze", &self.settings.retry, |_| {
            analyzer.analyze(self.subject, hint)
        })
        .await?;
        info!(findings = findings.findings.len(), "analysis finished");
        state.checkpoint_mut().findings = findings.findings.clone();

        if !findings.requires_action() {
            state.checkpoint_mut().proposal = Some(ChangeProposal::none());
            return Ok(CycleOutcome::NoIssues);
        }

        state.transition(Stage::Proposing)?;
        self.substrate.checkpoint(state).await?;

        let proposer = &self.collaborators.proposer;
        let proposal = run_activity(self.substrate, "propose", &self.settings.retry, |_| {
            proposer.propose(&findings, &findings.snapshot)
        })
        .await?;
        info!(
            proposal_id = proposal.id(),
            targets = proposal.targets().len(),
            "proposal generated"
        );
        state.checkpoint_mut().proposal = Some(proposal.clone());

        if !proposal.has_changes() {
            return Ok(CycleOutcome::NoUpdates);
        }
        self.substrate.checkpoint(state).await?;
        self.from_gate(state, proposal).await
    }

    async fn from_gate(
        &self,
        state: &mut WorkflowState,
        proposal: ChangeProposal,
    ) -> Result<CycleOutcome> {
        let request = GateRequest {
            proposal: &proposal,
            auto_approve: self.trigger.auto_approve,
            timeout: self.trigger.approval_timeout,
            poll_interval: self.settings.poll_interval,
            retry: &self.settings.retry,
        };
        let decision = await_approval(
            self.substrate,
            self.collaborators.notifier.as_ref(),
            state,
            &request,
        )
        .await?;
        match decision.decision {
            ApprovalDecision::Approved => self.from_apply(state, &proposal).await,
            ApprovalDecision::Rejected => Ok(CycleOutcome::Rejected),
            ApprovalDecision::TimedOut => Ok(CycleOutcome::TimedOut),
        }
    }

    async fn from_apply(
        &self,
        state: &mut WorkflowState,
        proposal: &ChangeProposal,
    ) -> Result<CycleOutcome> {
        if state.stage != Stage::Applying {
            state.transition(Stage::Applying)?;
            self.substrate.checkpoint(state).await?;
        }

        let applier = &self.collaborators.applier;
        let result = run_activity(self.substrate, "apply", &self.settings.retry, |_| {
            applier.apply(proposal, self.subject)
        })
        .await?;
        let applied = result.applied().count();
        let failed: Vec<&str> = result.failed().map(|t| t.target.as_str()).collect();
        if applied == 0 {
            return Err(anyhow!(
                "failed to apply changes to {}: {}",
                failed.join(", "),
                result
                    .failed()
                    .map(|t| t.message.as_str())
                    .collect::<Vec<_>>()
                    .join("; ")
            ));
        }
        if !failed.is_empty() {
            warn!(applied, failed = failed.len(), "some targets failed to apply");
        }
        info!(applied, "changes applied");

        state.checkpoint_mut().apply = Some(result.clone());
        state.transition(Stage::Validating)?;
        self.substrate.checkpoint(state).await?;
        self.from_validate(state, proposal, &result).await
    }

    async fn from_validate(
        &self,
        state: &mut WorkflowState,
        proposal: &ChangeProposal,
        apply: &ApplyResult,
    ) -> Result<CycleOutcome> {
        let validator = &self.collaborators.validator;
        let validation = match run_activity(self.substrate, "validate", &self.settings.retry, |_| {
            validator.validate(self.subject)
        })
        .await
        {
            Ok(validation) => validation,
            Err(err) if is_cancelled(&err) => return Err(err),
            Err(err) => ValidationResult::failed(format!("{err:#}")),
        };
        info!(success = validation.success, warnings = validation.warnings.len(), "validation finished");
        state.checkpoint_mut().validation = Some(validation.clone());

        let outcome = if !validation.success {
            let backups: Vec<PathBuf> = apply.targets.iter().filter_map(|t| t.backup.clone()).collect();
            CycleOutcome::ValidationFailed {
                error: validation
                    .error
                    .clone()
                    .unwrap_or_else(|| "validation failed".to_string()),
                backups,
            }
        } else if apply.all_succeeded() {
            CycleOutcome::Applied {
                targets: apply.applied().map(|t| t.target.clone()).collect(),
                summary: proposal.summary().to_string(),
            }
        } else {
            CycleOutcome::PartiallyApplied {
                applied: apply.applied().map(|t| t.target.clone()).collect(),
                failed: apply.failed().map(|t| t.target.clone()).collect(),
            }
        };
        Ok(outcome)
    }

    /// Checkpoint `outcome` in `Reporting`, journal the cycle and send the final notice.
    async fn report(&self, state: &mut WorkflowState, outcome: CycleOutcome) -> Result<CycleOutcome> {
        if state.stage != Stage::Reporting {
            state.transition(Stage::Reporting)?;
        }
        state.checkpoint_mut().outcome = Some(outcome.clone());
        state.last_outcome = Some(outcome.clone());
        self.substrate.checkpoint(state).await?;

        let report = cycle_report(state, self.substrate.now(), outcome.clone());
        self.substrate
            .record_cycle(&report)
            .await
            .context("record cycle report")?;
        info!(outcome = %outcome, "cycle finished");

        if self.settings.notify_final {
            self.notify_final(&report).await;
        }
        Ok(outcome)
    }

    async fn notify_final(&self, report: &CycleReport) {
        let notice = Notice {
            kind: NoticeKind::CycleReport,
            workflow_id: report.workflow_id.clone(),
            key: format!("{}-{}-report", report.workflow_id, report.iteration),
            message: report.outcome.message(),
            payload: json!({
                "iteration": report.iteration,
                "outcome": report.outcome,
                "validation": report.validation,
            }),
        };
        let notifier = &self.collaborators.notifier;
        if let Err(err) = run_activity(self.substrate, "notify-final", &self.settings.retry, |_| {
            notifier.notify(&notice)
        })
        .await
        {
            warn!(err = %format!("{err:#}"), "final notification failed");
        } else {
            debug!("final notification sent");
        }
    }
}

/// Journal entry for the current cycle of `state`.
pub fn cycle_report(
    state: &WorkflowState,
    finished_at: chrono::DateTime<chrono::Utc>,
    outcome: CycleOutcome,
) -> CycleReport {
    let checkpoint = state.checkpoint.as_ref();
    let decision = checkpoint
        .and_then(|c| c.gate.as_ref())
        .and_then(|g| g.decision)
        .map(|d| d.decision)
        .or_else(|| {
            checkpoint
                .and_then(|c| c.apply.as_ref())
                .map(|_| ApprovalDecision::Approved)
        });
    CycleReport {
        workflow_id: state.workflow_id.clone(),
        iteration: state.iteration,
        started_at: state.last_cycle_at,
        finished_at,
        findings: checkpoint.map(|c| c.findings.clone()).unwrap_or_default(),
        proposal: checkpoint.and_then(|c| c.proposal.clone()),
        decision,
        apply: checkpoint.and_then(|c| c.apply.clone()),
        validation: checkpoint.and_then(|c| c.validation.clone()),
        outcome,
    }
}

fn checkpointed_proposal(state: &WorkflowState) -> Result<ChangeProposal> {
    state
        .checkpoint
        .as_ref()
        .and_then(|c| c.proposal.clone())
        .context("resume without checkpointed proposal")
}
