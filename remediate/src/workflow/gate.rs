//! Approval gate: suspend until an approve/reject signal or the deadline.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::core::ids::gate_id;
use crate::core::retry::RetryPolicy;
use crate::core::state::{GateRecord, Stage, WorkflowState};
use crate::core::types::{ApprovalDecision, ChangeProposal, DecisionSlot, GateDecision};
use crate::workflow::activity::run_activity;
use crate::workflow::collaborators::{Notice, NoticeKind, Notifier};
use crate::workflow::error::Cancelled;
use crate::workflow::substrate::{Substrate, Wake};

pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Inputs for one gate entry.
pub struct GateRequest<'a> {
    pub proposal: &'a ChangeProposal,
    pub auto_approve: bool,
    pub timeout: Duration,
    /// Clamped to `(0, MAX_POLL_INTERVAL]`.
    pub poll_interval: Duration,
    pub retry: &'a RetryPolicy,
}

/// Resolve the gate for the current cycle of `state`.
///
/// Auto-approval returns immediately and leaves `state` untouched. Otherwise the
/// gate moves `state` to `AwaitingApproval`, dispatches exactly one approval
/// request and polls for the first signal until the deadline. Re-entering with a
/// checkpointed gate record for the same iteration continues that entry: the
/// deadline is kept and no second notification is sent.
///
/// Cancellation observed while waiting returns a [`Cancelled`] error.
#[instrument(skip_all, fields(workflow_id = %state.workflow_id, iteration = state.iteration))]
pub async fn await_approval<S: Substrate + ?Sized>(
    substrate: &S,
    notifier: &dyn Notifier,
    state: &mut WorkflowState,
    request: &GateRequest<'_>,
) -> Result<GateDecision> {
    if request.auto_approve {
        debug!("auto-approve enabled; skipping gate");
        return Ok(GateDecision {
            decision: ApprovalDecision::Approved,
            decided_at: substrate.now(),
        });
    }

    let id = gate_id(&state.workflow_id, state.iteration);
    let mut record = match open_record(state, &id) {
        Some(record) => {
            info!(gate_id = %id, notified = record.notified, "resuming approval gate");
            record
        }
        None => {
            state.transition(Stage::AwaitingApproval)?;
            let stale = substrate.discard_signals().await?;
            if stale > 0 {
                debug!(stale, "discarded signals sent before the gate opened");
            }
            let opened_at = substrate.now();
            let timeout = chrono::Duration::from_std(request.timeout)
                .context("approval timeout out of range")?;
            let record = GateRecord {
                gate_id: id.clone(),
                opened_at,
                deadline: opened_at + timeout,
                notified: false,
                decision: None,
            };
            state.checkpoint_mut().gate = Some(record.clone());
            substrate.checkpoint(state).await?;
            info!(gate_id = %id, deadline = %record.deadline, "approval gate opened");
            record
        }
    };

    if let Some(decision) = record.decision {
        return Ok(decision);
    }

    if !record.notified {
        let notice = approval_notice(state, &record, request.proposal);
        run_activity(substrate, "notify", request.retry, |_| notifier.notify(&notice)).await?;
        record.notified = true;
        state.checkpoint_mut().gate = Some(record.clone());
        substrate.checkpoint(state).await?;
    }

    let poll = request
        .poll_interval
        .clamp(Duration::from_millis(1), MAX_POLL_INTERVAL);
    let mut slot = DecisionSlot::new();
    while slot.get().is_none() {
        if substrate.cancellation_requested().await? {
            return Err(Cancelled::during("approval wait").into());
        }
        if let Some(signal) = substrate.take_signal().await? {
            slot.settle(GateDecision {
                decision: ApprovalDecision::from_signal(signal.approved),
                decided_at: substrate.now(),
            });
            continue;
        }
        let now = substrate.now();
        if now >= record.deadline {
            slot.settle(GateDecision {
                decision: ApprovalDecision::TimedOut,
                decided_at: now,
            });
            continue;
        }
        let remaining = (record.deadline - now).to_std().unwrap_or(Duration::ZERO);
        if substrate.sleep(poll.min(remaining)).await == Wake::Cancelled {
            return Err(Cancelled::during("approval wait").into());
        }
    }

    let decision = slot
        .get()
        .context("approval gate exited without a decision")?;
    record.decision = Some(decision);
    state.checkpoint_mut().gate = Some(record);
    substrate.checkpoint(state).await?;

    let late = substrate.discard_signals().await?;
    if late > 0 {
        debug!(late, "ignored signals after the gate decided");
    }
    info!(decision = ?decision.decision, "approval gate closed");
    Ok(decision)
}

/// Gate record of the current cycle, if it was already opened.
fn open_record(state: &WorkflowState, id: &str) -> Option<GateRecord> {
    if state.stage != Stage::AwaitingApproval {
        return None;
    }
    state
        .checkpoint
        .as_ref()
        .and_then(|c| c.gate.clone())
        .filter(|record| record.gate_id == id)
}

fn approval_notice(state: &WorkflowState, record: &GateRecord, proposal: &ChangeProposal) -> Notice {
    let targets = proposal.target_paths().join(", ");
    Notice {
        kind: NoticeKind::ApprovalRequest,
        workflow_id: state.workflow_id.clone(),
        key: record.gate_id.clone(),
        message: format!(
            "Approval requested for changes to {targets}: {}. Approve or reject before {}.",
            proposal.summary(),
            record.deadline.to_rfc3339()
        ),
        payload: json!({
            "gate_id": record.gate_id,
            "subject": state.subject,
            "deadline": record.deadline,
            "proposal": proposal,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{DateTime, Utc};

    use super::*;
    use crate::core::types::TargetChange;
    use crate::io::substrate::LocalSubstrate;
    use crate::test_support::RecordingNotifier;
    use crate::workflow::error::is_cancelled;
    use crate::workflow::substrate::ApprovalSignal;

    fn proposal() -> ChangeProposal {
        let mut targets = BTreeMap::new();
        targets.insert(
            "src/a.ts".to_string(),
            TargetChange {
                current: "let x = 1".to_string(),
                new: "const x = 1;".to_string(),
                diffs: Vec::new(),
                executable: false,
            },
        );
        ChangeProposal::new("prefer const", targets)
    }

    fn proposing_state() -> WorkflowState {
        let mut state = WorkflowState::new("wf-1", "fix:src/a.ts");
        state
            .begin_cycle(DateTime::<Utc>::UNIX_EPOCH)
            .expect("begin");
        state.transition(Stage::Proposing).expect("propose");
        state
    }

    fn request<'a>(proposal: &'a ChangeProposal, retry: &'a RetryPolicy) -> GateRequest<'a> {
        GateRequest {
            proposal,
            auto_approve: false,
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            retry,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn auto_approve_skips_notification_and_state() {
        let substrate = LocalSubstrate::in_memory();
        let notifier = RecordingNotifier::default();
        let mut state = proposing_state();
        let proposal = proposal();
        let retry = RetryPolicy::default();
        let mut req = request(&proposal, &retry);
        req.auto_approve = true;

        let decision = await_approval(&substrate, &notifier, &mut state, &req)
            .await
            .expect("gate");
        assert_eq!(decision.decision, ApprovalDecision::Approved);
        assert_eq!(notifier.count(), 0);
        assert_eq!(state.stage, Stage::Proposing);
    }

    /// Signal before the deadline decides; exactly one notification over many polls.
    #[tokio::test(start_paused = true)]
    async fn signal_before_deadline_wins() {
        let substrate = LocalSubstrate::in_memory();
        let sender = substrate.signal_sender();
        let notifier = RecordingNotifier::default();
        let mut state = proposing_state();
        let proposal = proposal();
        let retry = RetryPolicy::default();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(4)).await;
            sender.send(ApprovalSignal::approve());
        });
        let decision = await_approval(&substrate, &notifier, &mut state, &request(&proposal, &retry))
            .await
            .expect("gate");

        assert_eq!(decision.decision, ApprovalDecision::Approved);
        assert_eq!(notifier.count(), 1);
        let gate = state
            .checkpoint
            .as_ref()
            .and_then(|c| c.gate.clone())
            .expect("gate record");
        assert!(gate.notified);
        assert_eq!(gate.decision, Some(decision));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_without_signal_times_out() {
        let substrate = LocalSubstrate::in_memory();
        let notifier = RecordingNotifier::default();
        let mut state = proposing_state();
        let proposal = proposal();
        let retry = RetryPolicy::default();

        let started = tokio::time::Instant::now();
        let decision = await_approval(&substrate, &notifier, &mut state, &request(&proposal, &retry))
            .await
            .expect("gate");
        assert_eq!(decision.decision, ApprovalDecision::TimedOut);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(10) && waited < Duration::from_secs(12));
    }

    /// The first signal wins; a second one is discarded when the gate closes.
    #[tokio::test(start_paused = true)]
    async fn first_signal_wins_and_late_ones_are_dropped() {
        let substrate = LocalSubstrate::in_memory();
        let sender = substrate.signal_sender();
        let notifier = RecordingNotifier::default();
        let mut state = proposing_state();
        let proposal = proposal();
        let retry = RetryPolicy::default();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            sender.send(ApprovalSignal::reject());
            sender.send(ApprovalSignal::approve());
        });
        let decision = await_approval(&substrate, &notifier, &mut state, &request(&proposal, &retry))
            .await
            .expect("gate");
        assert_eq!(decision.decision, ApprovalDecision::Rejected);
        assert_eq!(substrate.take_signal().await.expect("take"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_signals_do_not_decide_a_new_gate() {
        let substrate = LocalSubstrate::in_memory();
        substrate.signal_sender().send(ApprovalSignal::approve());
        let notifier = RecordingNotifier::default();
        let mut state = proposing_state();
        let proposal = proposal();
        let retry = RetryPolicy::default();

        let decision = await_approval(&substrate, &notifier, &mut state, &request(&proposal, &retry))
            .await
            .expect("gate");
        assert_eq!(decision.decision, ApprovalDecision::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_gate_keeps_deadline_and_does_not_renotify() {
        let substrate = LocalSubstrate::in_memory();
        let notifier = RecordingNotifier::default();
        let mut state = proposing_state();
        let proposal = proposal();
        let retry = RetryPolicy::default();

        // First entry is interrupted mid-wait.
        let interrupted = tokio::time::timeout(
            Duration::from_secs(3),
            await_approval(&substrate, &notifier, &mut state, &request(&proposal, &retry)),
        )
        .await;
        assert!(interrupted.is_err());
        assert_eq!(notifier.count(), 1);
        let deadline = state
            .checkpoint
            .as_ref()
            .and_then(|c| c.gate.as_ref())
            .map(|g| g.deadline)
            .expect("deadline");

        let decision = await_approval(&substrate, &notifier, &mut state, &request(&proposal, &retry))
            .await
            .expect("gate");
        assert_eq!(decision.decision, ApprovalDecision::TimedOut);
        assert!(decision.decided_at >= deadline);
        assert!(decision.decided_at < deadline + chrono::Duration::seconds(1));
        assert_eq!(notifier.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_while_waiting() {
        let substrate = LocalSubstrate::in_memory();
        let cancel = substrate.cancel_handle();
        let notifier = RecordingNotifier::default();
        let mut state = proposing_state();
        let proposal = proposal();
        let retry = RetryPolicy::default();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            cancel.cancel();
        });
        let err = await_approval(&substrate, &notifier, &mut state, &request(&proposal, &retry))
            .await
            .expect_err("cancelled");
        assert!(is_cancelled(&err));
        assert_eq!(state.stage, Stage::AwaitingApproval);
    }
}
