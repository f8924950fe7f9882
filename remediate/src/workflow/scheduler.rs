//! Scheduler loop: drives cycles once (on-demand) or on a fixed cadence (interval).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{error, info, instrument, warn};

use crate::core::ids::workflow_id;
use crate::core::outcome::CycleOutcome;
use crate::core::state::{ResumePoint, Stage, WorkflowState};
use crate::core::trigger::TriggerSpec;
use crate::core::types::Subject;
use crate::workflow::collaborators::Collaborators;
use crate::workflow::error::{Cancelled, InputError, is_cancelled, is_input_error};
use crate::workflow::pipeline::{CycleEntry, CycleRunner, PipelineSettings, cycle_report};
use crate::workflow::substrate::{Substrate, Wake};

/// Final result of [`Workflow::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub workflow_id: String,
    /// Cycles started over the lifetime of the workflow.
    pub iterations: u32,
    pub outcome: CycleOutcome,
}

impl RunOutcome {
    pub fn message(&self) -> String {
        self.outcome.message()
    }
}

/// One long-lived remediation loop for a single subject.
pub struct Workflow<S: Substrate + ?Sized> {
    workflow_id: String,
    subject: Subject,
    trigger: TriggerSpec,
    collaborators: Collaborators,
    settings: PipelineSettings,
    substrate: Arc<S>,
    restart_finished: bool,
}

impl<S: Substrate + ?Sized> Workflow<S> {
    pub fn new(
        subject: Subject,
        trigger: TriggerSpec,
        collaborators: Collaborators,
        substrate: Arc<S>,
    ) -> Self {
        Self {
            workflow_id: workflow_id(&subject.locator()),
            subject,
            trigger,
            collaborators,
            settings: PipelineSettings::default(),
            substrate,
            restart_finished: false,
        }
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Start a new run when the persisted state is already `Done`, instead of
    /// returning its recorded outcome.
    pub fn restart_finished(mut self, restart: bool) -> Self {
        self.restart_finished = restart;
        self
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Run until the trigger is exhausted, cancellation is observed or an input error occurs.
    ///
    /// Cycle-level failures are reported through [`RunOutcome::outcome`]; `Err` is
    /// returned when the substrate fails or the persisted state belongs to
    /// another workflow.
    #[instrument(skip_all, fields(workflow_id = %self.workflow_id))]
    pub async fn run(&self) -> Result<RunOutcome> {
        if let Err(err) = self.trigger.validate().and_then(|()| self.settings.retry.validate()) {
            let message = format!("{err:#}");
            error!(err = %message, "invalid workflow configuration");
            return Ok(self.outcome_for(0, CycleOutcome::Failed { error: message }));
        }

        let mut state = self.load_state().await?;
        let mut next = state.resume_point();
        if next != ResumePoint::Fresh {
            info!(stage = state.stage.as_str(), iteration = state.iteration, "resuming workflow");
        }

        loop {
            let result = match next {
                ResumePoint::Finished => {
                    let outcome = state.last_outcome.clone().unwrap_or(CycleOutcome::Failed {
                        error: "workflow finished without a recorded outcome".to_string(),
                    });
                    return Ok(self.outcome_for(state.iteration, outcome));
                }
                ResumePoint::Fresh => self.start_cycle(&mut state).await,
                ResumePoint::RestartCycle => {
                    state.restart_cycle()?;
                    self.substrate.checkpoint(&state).await?;
                    self.cycle(&mut state, CycleEntry::Analyze).await
                }
                ResumePoint::AwaitApproval => self.cycle(&mut state, CycleEntry::Gate).await,
                ResumePoint::Apply => self.cycle(&mut state, CycleEntry::Apply).await,
                ResumePoint::Validate => self.cycle(&mut state, CycleEntry::Validate).await,
                ResumePoint::Report => self.cycle(&mut state, CycleEntry::Report).await,
                ResumePoint::Sleep(wake_at) | ResumePoint::Recover(wake_at) => {
                    if self.sleep_until(wake_at).await == Wake::Cancelled {
                        return self.finish(&mut state, CycleOutcome::Cancelled).await;
                    }
                    self.start_cycle(&mut state).await
                }
            };

            next = match result {
                Ok(outcome) => match self.trigger.next_cycle_delay() {
                    None => return self.finish(&mut state, outcome).await,
                    Some(period) => {
                        state.transition(Stage::Sleeping)?;
                        state.wake_at = Some(self.after(period)?);
                        self.substrate.checkpoint(&state).await?;
                        info!(wake_at = ?state.wake_at, "sleeping until next cycle");
                        ResumePoint::Sleep(state.wake_at)
                    }
                },
                Err(err) if is_cancelled(&err) => {
                    info!("cancellation requested; stopping workflow");
                    self.record_failed_cycle(&state, CycleOutcome::Cancelled).await;
                    return self.finish(&mut state, CycleOutcome::Cancelled).await;
                }
                Err(err) if is_input_error(&err) => {
                    let outcome = CycleOutcome::Failed {
                        error: format!("{err:#}"),
                    };
                    error!(err = %format!("{err:#}"), "input error; stopping workflow");
                    self.record_failed_cycle(&state, outcome.clone()).await;
                    return self.finish(&mut state, outcome).await;
                }
                Err(err) => {
                    let outcome = CycleOutcome::Failed {
                        error: format!("{err:#}"),
                    };
                    error!(stage = state.stage.as_str(), err = %format!("{err:#}"), "cycle failed");
                    self.record_failed_cycle(&state, outcome.clone()).await;
                    match self.trigger.error_backoff() {
                        None => return self.finish(&mut state, outcome).await,
                        Some(backoff) => {
                            state.transition(Stage::ErrorRecovery)?;
                            state.wake_at = Some(self.after(backoff)?);
                            state.last_outcome = Some(outcome);
                            self.substrate.checkpoint(&state).await?;
                            warn!(wake_at = ?state.wake_at, "entering error recovery");
                            ResumePoint::Recover(state.wake_at)
                        }
                    }
                }
            };
        }
    }

    async fn load_state(&self) -> Result<WorkflowState> {
        let fresh = || WorkflowState::new(self.workflow_id.clone(), self.subject.locator());
        let Some(state) = self.substrate.load().await.context("load workflow state")? else {
            return Ok(fresh());
        };
        if state.workflow_id != self.workflow_id {
            return Err(InputError::new(format!(
                "persisted state belongs to workflow {}, expected {}",
                state.workflow_id, self.workflow_id
            ))
            .into());
        }
        if state.stage == Stage::Done && self.restart_finished {
            info!(previous_iterations = state.iteration, "starting a new run of a finished workflow");
            let mut restarted = fresh();
            // Keep counting so cycle journals of earlier runs are not overwritten.
            restarted.iteration = state.iteration;
            return Ok(restarted);
        }
        Ok(state)
    }

    async fn start_cycle(&self, state: &mut WorkflowState) -> Result<CycleOutcome> {
        if self.substrate.cancellation_requested().await? {
            return Err(Cancelled::during("cycle start").into());
        }
        let iteration = state.begin_cycle(self.substrate.now())?;
        self.substrate.checkpoint(state).await?;
        info!(iteration, "cycle started");
        self.cycle(state, CycleEntry::Analyze).await
    }

    async fn cycle(&self, state: &mut WorkflowState, entry: CycleEntry) -> Result<CycleOutcome> {
        CycleRunner {
            substrate: self.substrate.as_ref(),
            collaborators: &self.collaborators,
            subject: &self.subject,
            trigger: &self.trigger,
            settings: &self.settings,
        }
        .run(state, entry)
        .await
    }

    async fn sleep_until(&self, wake_at: Option<DateTime<Utc>>) -> Wake {
        let remaining = wake_at
            .and_then(|at| (at - self.substrate.now()).to_std().ok())
            .unwrap_or(Duration::ZERO);
        self.substrate.sleep(remaining).await
    }

    fn after(&self, delay: Duration) -> Result<DateTime<Utc>> {
        let delay = chrono::Duration::from_std(delay).context("delay out of range")?;
        Ok(self.substrate.now() + delay)
    }

    /// Journal a cycle that ended through an error path. Best effort.
    ///
    /// Only a cycle still in flight is recorded; between cycles the checkpoint
    /// belongs to the previous, already journaled cycle.
    async fn record_failed_cycle(&self, state: &WorkflowState, outcome: CycleOutcome) {
        let in_flight = matches!(
            state.stage,
            Stage::Analyzing
                | Stage::Proposing
                | Stage::AwaitingApproval
                | Stage::Applying
                | Stage::Validating
        );
        if !in_flight || state.checkpoint.is_none() {
            return;
        }
        let report = cycle_report(state, self.substrate.now(), outcome);
        if let Err(err) = self.substrate.record_cycle(&report).await {
            warn!(err = %format!("{err:#}"), "failed to record cycle report");
        }
    }

    async fn finish(&self, state: &mut WorkflowState, outcome: CycleOutcome) -> Result<RunOutcome> {
        if state.stage != Stage::Done {
            state.transition(Stage::Done)?;
        }
        state.pending_approval = false;
        state.last_outcome = Some(outcome.clone());
        self.substrate.checkpoint(state).await?;
        info!(outcome = %outcome, "workflow finished");
        Ok(self.outcome_for(state.iteration, outcome))
    }

    fn outcome_for(&self, iterations: u32, outcome: CycleOutcome) -> RunOutcome {
        RunOutcome {
            workflow_id: self.workflow_id.clone(),
            iterations,
            outcome,
        }
    }
}
