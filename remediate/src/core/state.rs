//! Durable workflow state and the stage transition rules.
//!
//! The state is owned by the scheduler loop and checkpointed through the
//! substrate after every transition, so a restarted process resumes at the same
//! logical point instead of starting over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::outcome::CycleOutcome;
use crate::core::types::{ApplyResult, ChangeProposal, Finding, GateDecision, ValidationResult};

/// Position of the orchestration loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Analyzing,
    Proposing,
    AwaitingApproval,
    Applying,
    Validating,
    Reporting,
    Sleeping,
    ErrorRecovery,
    Done,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        self == Stage::Done
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Analyzing => "analyzing",
            Stage::Proposing => "proposing",
            Stage::AwaitingApproval => "awaiting_approval",
            Stage::Applying => "applying",
            Stage::Validating => "validating",
            Stage::Reporting => "reporting",
            Stage::Sleeping => "sleeping",
            Stage::ErrorRecovery => "error_recovery",
            Stage::Done => "done",
        }
    }

    /// Whether `self -> next` is a legal edge of the stage machine.
    pub fn can_transition_to(self, next: Stage) -> bool {
        use Stage::{
            Analyzing, Applying, AwaitingApproval, Done, ErrorRecovery, Idle, Proposing,
            Reporting, Sleeping, Validating,
        };
        if self == Done {
            return false;
        }
        match next {
            Done => true,
            ErrorRecovery => self != ErrorRecovery,
            Analyzing => matches!(self, Idle | Sleeping | ErrorRecovery),
            Proposing => self == Analyzing,
            AwaitingApproval => self == Proposing,
            Applying => matches!(self, Proposing | AwaitingApproval),
            Validating => self == Applying,
            Reporting => matches!(self, Analyzing | Proposing | AwaitingApproval | Validating),
            Sleeping => self == Reporting,
            Idle => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal stage transition {} -> {}", from.as_str(), to.as_str())]
pub struct TransitionError {
    pub from: Stage,
    pub to: Stage,
}

/// Durable record of one approval gate entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRecord {
    pub gate_id: String,
    pub opened_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// Set once the approval request has been dispatched; never dispatched twice.
    pub notified: bool,
    #[serde(default)]
    pub decision: Option<GateDecision>,
}

/// In-flight data of the current cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleCheckpoint {
    pub iteration: u32,
    /// Findings of this cycle, kept for the cycle journal.
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub proposal: Option<ChangeProposal>,
    #[serde(default)]
    pub gate: Option<GateRecord>,
    #[serde(default)]
    pub apply: Option<ApplyResult>,
    #[serde(default)]
    pub validation: Option<ValidationResult>,
    #[serde(default)]
    pub outcome: Option<CycleOutcome>,
}

impl CycleCheckpoint {
    pub fn new(iteration: u32) -> Self {
        Self {
            iteration,
            findings: Vec::new(),
            proposal: None,
            gate: None,
            apply: None,
            validation: None,
            outcome: None,
        }
    }
}

/// Persisted state of one workflow instance (`workflows/<id>/state.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    /// Human-readable subject locator (e.g. `fix:src/app.ts`).
    pub subject: String,
    pub stage: Stage,
    /// Number of cycles started so far.
    pub iteration: u32,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub pending_approval: bool,
    /// Wake-up time while `Sleeping` or in `ErrorRecovery`.
    #[serde(default)]
    pub wake_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub checkpoint: Option<CycleCheckpoint>,
    #[serde(default)]
    pub last_outcome: Option<CycleOutcome>,
}

impl WorkflowState {
    pub fn new(workflow_id: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            subject: subject.into(),
            stage: Stage::Idle,
            iteration: 0,
            last_cycle_at: None,
            pending_approval: false,
            wake_at: None,
            checkpoint: None,
            last_outcome: None,
        }
    }

    /// Move to `to`, rejecting edges the stage machine does not allow.
    pub fn transition(&mut self, to: Stage) -> Result<(), TransitionError> {
        if !self.stage.can_transition_to(to) {
            return Err(TransitionError {
                from: self.stage,
                to,
            });
        }
        self.stage = to;
        self.pending_approval = to == Stage::AwaitingApproval;
        if !matches!(to, Stage::Sleeping | Stage::ErrorRecovery) {
            self.wake_at = None;
        }
        Ok(())
    }

    /// Enter `Analyzing` for a new cycle and return its iteration number.
    pub fn begin_cycle(&mut self, at: DateTime<Utc>) -> Result<u32, TransitionError> {
        self.transition(Stage::Analyzing)?;
        self.iteration += 1;
        self.last_cycle_at = Some(at);
        self.checkpoint = Some(CycleCheckpoint::new(self.iteration));
        Ok(self.iteration)
    }

    /// Restart an interrupted cycle from `Analyzing` without counting a new iteration.
    ///
    /// Only valid while analysis or proposal generation was in flight: both are
    /// read-only, so repeating them cannot duplicate a side effect.
    pub fn restart_cycle(&mut self) -> Result<u32, TransitionError> {
        if !matches!(self.stage, Stage::Analyzing | Stage::Proposing) {
            return Err(TransitionError {
                from: self.stage,
                to: Stage::Analyzing,
            });
        }
        self.stage = Stage::Analyzing;
        self.pending_approval = false;
        let iteration = self.iteration.max(1);
        self.iteration = iteration;
        self.checkpoint = Some(CycleCheckpoint::new(iteration));
        Ok(iteration)
    }

    pub fn checkpoint_mut(&mut self) -> &mut CycleCheckpoint {
        let iteration = self.iteration;
        self.checkpoint
            .get_or_insert_with(|| CycleCheckpoint::new(iteration))
    }

    /// Where a loaded state should continue.
    pub fn resume_point(&self) -> ResumePoint {
        let checkpoint = self.checkpoint.as_ref();
        let proposal = checkpoint.and_then(|c| c.proposal.as_ref());
        match self.stage {
            Stage::Idle => ResumePoint::Fresh,
            Stage::Analyzing | Stage::Proposing => ResumePoint::RestartCycle,
            Stage::AwaitingApproval => match (proposal, checkpoint.and_then(|c| c.gate.as_ref())) {
                (Some(_), Some(_)) => ResumePoint::AwaitApproval,
                _ => ResumePoint::RestartCycle,
            },
            Stage::Applying => match proposal {
                Some(_) => ResumePoint::Apply,
                None => ResumePoint::RestartCycle,
            },
            Stage::Validating => match checkpoint.and_then(|c| c.apply.as_ref()) {
                Some(_) => ResumePoint::Validate,
                None => ResumePoint::Apply,
            },
            Stage::Reporting => match checkpoint.and_then(|c| c.outcome.as_ref()) {
                Some(_) => ResumePoint::Report,
                None => ResumePoint::RestartCycle,
            },
            Stage::Sleeping => ResumePoint::Sleep(self.wake_at),
            Stage::ErrorRecovery => ResumePoint::Recover(self.wake_at),
            Stage::Done => ResumePoint::Finished,
        }
    }
}

/// Continuation derived from a persisted [`WorkflowState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    Fresh,
    RestartCycle,
    AwaitApproval,
    Apply,
    Validate,
    Report,
    Sleep(Option<DateTime<Utc>>),
    Recover(Option<DateTime<Utc>>),
    Finished,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH
    }

    #[test]
    fn full_cycle_follows_legal_edges() {
        let mut state = WorkflowState::new("wf-1", "fix:a.ts");
        assert_eq!(state.begin_cycle(at()), Ok(1));
        for stage in [
            Stage::Proposing,
            Stage::AwaitingApproval,
            Stage::Applying,
            Stage::Validating,
            Stage::Reporting,
            Stage::Sleeping,
        ] {
            state.transition(stage).expect("legal edge");
        }
        assert_eq!(state.begin_cycle(at()), Ok(2));
    }

    #[test]
    fn pending_approval_tracks_gate_stage() {
        let mut state = WorkflowState::new("wf-1", "fix:a.ts");
        state.begin_cycle(at()).expect("begin");
        state.transition(Stage::Proposing).expect("propose");
        state.transition(Stage::AwaitingApproval).expect("gate");
        assert!(state.pending_approval);
        state.transition(Stage::Reporting).expect("report");
        assert!(!state.pending_approval);
    }

    #[test]
    fn illegal_edges_are_rejected() {
        let mut state = WorkflowState::new("wf-1", "fix:a.ts");
        let err = state.transition(Stage::Applying).expect_err("idle cannot apply");
        assert_eq!(err.from, Stage::Idle);
        assert_eq!(err.to, Stage::Applying);

        state.transition(Stage::Done).expect("done");
        assert!(state.transition(Stage::Analyzing).is_err());
        assert!(state.transition(Stage::Done).is_err());
    }

    #[test]
    fn error_recovery_is_reachable_from_any_active_stage() {
        for stage in [
            Stage::Analyzing,
            Stage::Proposing,
            Stage::AwaitingApproval,
            Stage::Applying,
            Stage::Validating,
            Stage::Reporting,
        ] {
            assert!(stage.can_transition_to(Stage::ErrorRecovery), "{stage:?}");
        }
        assert!(Stage::ErrorRecovery.can_transition_to(Stage::Analyzing));
    }

    #[test]
    fn resume_point_requires_checkpointed_data() {
        let mut state = WorkflowState::new("wf-1", "fix:a.ts");
        state.begin_cycle(at()).expect("begin");
        state.transition(Stage::Proposing).expect("propose");
        state.transition(Stage::Applying).expect("apply");
        // No proposal recorded: the cycle must restart instead of applying nothing.
        assert_eq!(state.resume_point(), ResumePoint::RestartCycle);

        state.checkpoint_mut().proposal = Some(ChangeProposal::none());
        assert_eq!(state.resume_point(), ResumePoint::Apply);
    }

    #[test]
    fn restart_keeps_iteration() {
        let mut state = WorkflowState::new("wf-1", "fix:a.ts");
        state.begin_cycle(at()).expect("begin");
        state.transition(Stage::Proposing).expect("propose");
        assert_eq!(state.restart_cycle(), Ok(1));
        assert_eq!(state.stage, Stage::Analyzing);
    }
}
