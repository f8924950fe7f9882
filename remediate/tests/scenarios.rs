//! Workflow-level scenarios driven through `Workflow::run` with scripted collaborators.
//!
//! Timer-driven tests run on paused tokio time, so a 24h approval timeout or
//! an hourly cadence costs nothing in wall time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use remediate::core::ids::workflow_id;
use remediate::core::outcome::CycleOutcome;
use remediate::core::retry::RetryPolicy;
use remediate::core::state::Stage;
use remediate::core::trigger::TriggerSpec;
use remediate::core::types::{ApprovalDecision, Subject};
use remediate::io::apply::FsApplier;
use remediate::io::inbox::post_signal;
use remediate::io::journal::{list_cycles, load_cycle};
use remediate::io::paths::RemediatePaths;
use remediate::io::substrate::LocalSubstrate;
use remediate::test_support::{
    RecordingApplier, Scripted, ScriptedAnalyzer, ScriptedProposer, ScriptedValidator, temp_repo,
};
use remediate::workflow::collaborators::NoticeKind;
use remediate::workflow::pipeline::PipelineSettings;
use remediate::workflow::scheduler::Workflow;
use remediate::workflow::substrate::{ApprovalSignal, Substrate};

const PATH: &str = "src/app.ts";
const BEFORE: &str = "let x = 1\n";
const AFTER: &str = "const x = 1;\n";

fn subject() -> Subject {
    Subject::file(PATH)
}

fn workflow(
    scripted: &Scripted,
    trigger: TriggerSpec,
    substrate: Arc<LocalSubstrate>,
) -> Workflow<LocalSubstrate> {
    Workflow::new(subject(), trigger, scripted.collaborators(), substrate)
}

fn anchor() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-02T09:00:00Z")
        .expect("anchor")
        .with_timezone(&Utc)
}

/// Scenario A: auto-approve applies and validates once without entering the gate.
#[tokio::test(start_paused = true)]
async fn auto_approve_applies_without_gate() {
    let scripted = Scripted::fixing(PATH, BEFORE, AFTER);
    let substrate = Arc::new(LocalSubstrate::in_memory());
    let trigger = TriggerSpec::on_demand().with_auto_approve(true);

    let run = workflow(&scripted, trigger, substrate.clone())
        .run()
        .await
        .expect("run");

    assert!(matches!(run.outcome, CycleOutcome::Applied { .. }));
    assert_eq!(run.iterations, 1);
    assert_eq!(scripted.applier.calls(), 1);
    assert_eq!(scripted.validator.calls(), 1);
    assert_eq!(scripted.notifier.count(), 0);

    let state = substrate.load().await.expect("load").expect("state");
    assert_eq!(state.stage, Stage::Done);
    assert!(state.checkpoint.and_then(|c| c.gate).is_none());
    let reports = substrate.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].decision, Some(ApprovalDecision::Approved));
}

/// Scenario B: a reject two seconds into a 24h gate ends the cycle with nothing applied.
#[tokio::test(start_paused = true)]
async fn reject_signal_ends_cycle_without_apply() {
    let scripted = Scripted::fixing(PATH, BEFORE, AFTER);
    let substrate = Arc::new(LocalSubstrate::in_memory());
    let sender = substrate.signal_sender();
    let trigger = TriggerSpec::on_demand().with_approval_timeout(Duration::from_secs(24 * 3600));

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        sender.send(ApprovalSignal::reject());
    });
    let started = tokio::time::Instant::now();
    let run = workflow(&scripted, trigger, substrate.clone())
        .run()
        .await
        .expect("run");

    assert_eq!(run.outcome, CycleOutcome::Rejected);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(scripted.applier.calls(), 0);
    assert_eq!(scripted.validator.calls(), 0);
    assert_eq!(scripted.notifier.count(), 1);
    assert_eq!(
        substrate.reports()[0].decision,
        Some(ApprovalDecision::Rejected)
    );
}

/// Scenario C: no signal within a 1s timeout times out with nothing applied.
#[tokio::test(start_paused = true)]
async fn silence_times_out_after_deadline() {
    let scripted = Scripted::fixing(PATH, BEFORE, AFTER);
    let substrate = Arc::new(LocalSubstrate::in_memory());
    let trigger = TriggerSpec::on_demand().with_approval_timeout(Duration::from_secs(1));

    let started = tokio::time::Instant::now();
    let run = workflow(&scripted, trigger, substrate)
        .run()
        .await
        .expect("run");

    assert_eq!(run.outcome, CycleOutcome::TimedOut);
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(1) && waited < Duration::from_secs(3));
    assert_eq!(scripted.applier.calls(), 0);
    assert_eq!(scripted.notifier.count(), 1);
}

/// Scenario D: a proposal without changes skips gate, apply and validate.
#[tokio::test(start_paused = true)]
async fn empty_proposal_needs_no_updates() {
    let scripted =
        Scripted::fixing(PATH, BEFORE, AFTER).with_proposer(ScriptedProposer::unchanged());
    let substrate = Arc::new(LocalSubstrate::in_memory());

    let run = workflow(&scripted, TriggerSpec::on_demand(), substrate)
        .run()
        .await
        .expect("run");

    assert_eq!(run.outcome, CycleOutcome::NoUpdates);
    assert_eq!(scripted.notifier.count(), 0);
    assert_eq!(scripted.applier.calls(), 0);
    assert_eq!(scripted.validator.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn clean_subject_stops_after_analysis() {
    let scripted = Scripted::fixing(PATH, BEFORE, AFTER).with_analyzer(ScriptedAnalyzer::clean());
    let substrate = Arc::new(LocalSubstrate::in_memory());

    let run = workflow(&scripted, TriggerSpec::on_demand(), substrate)
        .run()
        .await
        .expect("run");

    assert_eq!(run.outcome, CycleOutcome::NoIssues);
    assert_eq!(scripted.proposer.calls(), 0);
    assert_eq!(scripted.applier.calls(), 0);
    assert_eq!(scripted.notifier.count_kind(NoticeKind::CycleReport), 1);
}

/// Scenario E: a failed validation leaves the applied content and its backup in place.
#[tokio::test]
async fn failed_validation_keeps_changes_and_backup() {
    let repo = temp_repo(&[(PATH, BEFORE)]);
    let paths = RemediatePaths::new(repo.path()).workflow("wf-e");
    let scripted = Scripted::fixing(PATH, BEFORE, AFTER)
        .with_validator(ScriptedValidator::failing("lint errors remain after fix"));
    let mut collaborators = scripted.collaborators();
    collaborators.applier = Arc::new(FsApplier::new(repo.path(), &paths.backups_dir));
    let substrate = Arc::new(LocalSubstrate::in_memory());
    let trigger = TriggerSpec::on_demand().with_auto_approve(true);

    let run = Workflow::new(subject(), trigger, collaborators, substrate)
        .run()
        .await
        .expect("run");

    let CycleOutcome::ValidationFailed { error, backups } = &run.outcome else {
        panic!("expected validation failure, got {:?}", run.outcome);
    };
    assert!(error.contains("lint errors remain"));
    assert_eq!(backups.len(), 1);
    assert_eq!(
        std::fs::read_to_string(&backups[0]).expect("backup"),
        BEFORE
    );
    assert_eq!(
        std::fs::read_to_string(repo.path().join(PATH)).expect("live file"),
        AFTER
    );
    assert!(run.message().contains("backups:"));
}

/// Running again against an already remediated file proposes nothing and touches nothing.
#[tokio::test]
async fn second_run_on_remediated_file_is_a_no_op() {
    let repo = temp_repo(&[(PATH, BEFORE)]);
    let paths = RemediatePaths::new(repo.path()).workflow("wf-idem");
    let scripted = Scripted::fixing(PATH, BEFORE, AFTER)
        .with_analyzer(ScriptedAnalyzer::reading(repo.path(), PATH));
    let mut collaborators = scripted.collaborators();
    collaborators.applier = Arc::new(FsApplier::new(repo.path(), &paths.backups_dir));
    let trigger = TriggerSpec::on_demand().with_auto_approve(true);

    let first = Workflow::new(
        subject(),
        trigger.clone(),
        collaborators.clone(),
        Arc::new(LocalSubstrate::in_memory()),
    )
    .run()
    .await
    .expect("first run");
    assert!(matches!(first.outcome, CycleOutcome::Applied { .. }), "{:?}", first.outcome);
    let live = repo.path().join(PATH);
    let modified = std::fs::metadata(&live).expect("metadata").modified().expect("mtime");
    let backups = std::fs::read_dir(&paths.backups_dir).expect("backups").count();

    let second = Workflow::new(
        subject(),
        trigger,
        collaborators,
        Arc::new(LocalSubstrate::in_memory()),
    )
    .run()
    .await
    .expect("second run");

    assert_eq!(second.outcome, CycleOutcome::NoUpdates);
    assert_eq!(scripted.proposer.calls(), 2);
    assert_eq!(scripted.validator.calls(), 1);
    assert_eq!(std::fs::read_to_string(&live).expect("live file"), AFTER);
    assert_eq!(
        std::fs::metadata(&live).expect("metadata").modified().expect("mtime"),
        modified
    );
    assert_eq!(std::fs::read_dir(&paths.backups_dir).expect("backups").count(), backups);
}

/// Apply that writes no target at all is a cycle error, not a validation run.
#[tokio::test(start_paused = true)]
async fn apply_failing_every_target_fails_cycle() {
    let scripted = Scripted::fixing(PATH, BEFORE, AFTER)
        .with_applier(RecordingApplier::failing_targets(&[PATH]));
    let trigger = TriggerSpec::on_demand().with_auto_approve(true);

    let run = workflow(&scripted, trigger, Arc::new(LocalSubstrate::in_memory()))
        .run()
        .await
        .expect("run");

    let CycleOutcome::Failed { error } = &run.outcome else {
        panic!("expected failure, got {:?}", run.outcome);
    };
    assert!(error.contains(PATH));
    assert_eq!(scripted.validator.calls(), 0);
}

/// A restarted process resumes the open gate: same deadline, no second notification,
/// no second analysis.
#[tokio::test(start_paused = true)]
async fn resume_in_gate_does_not_renotify() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = RemediatePaths::new(temp.path()).workflow(&workflow_id(&subject().locator()));
    let scripted = Scripted::fixing(PATH, BEFORE, AFTER);
    let trigger = TriggerSpec::on_demand();

    let first = Arc::new(LocalSubstrate::with_files(paths.clone()).anchored_at(anchor()));
    let interrupted = tokio::time::timeout(
        Duration::from_secs(3),
        workflow(&scripted, trigger.clone(), first).run(),
    )
    .await;
    assert!(interrupted.is_err(), "workflow should still be waiting");
    assert_eq!(scripted.notifier.count(), 1);

    post_signal(&paths.signals_dir, &ApprovalSignal::approve()).expect("post approve");
    let second = Arc::new(
        LocalSubstrate::with_files(paths.clone())
            .anchored_at(anchor() + chrono::Duration::seconds(5)),
    );
    let run = workflow(&scripted, trigger, second.clone())
        .run()
        .await
        .expect("resumed run");

    assert!(matches!(run.outcome, CycleOutcome::Applied { .. }));
    assert_eq!(run.iterations, 1);
    assert_eq!(scripted.notifier.count(), 1);
    assert_eq!(scripted.analyzer.calls(), 1);
    assert_eq!(scripted.proposer.calls(), 1);
    assert_eq!(scripted.applier.calls(), 1);

    assert_eq!(list_cycles(&paths.cycles_dir).expect("cycles"), vec![1]);
    let report = load_cycle(&paths.cycles_dir, 1).expect("cycle 1");
    assert_eq!(report.decision, Some(ApprovalDecision::Approved));
}

/// A finished workflow reports its last outcome unless asked to start over.
#[tokio::test(start_paused = true)]
async fn finished_workflow_returns_recorded_outcome() {
    let scripted = Scripted::fixing(PATH, BEFORE, AFTER);
    let substrate = Arc::new(LocalSubstrate::in_memory());
    let trigger = TriggerSpec::on_demand().with_auto_approve(true);

    let first = workflow(&scripted, trigger.clone(), substrate.clone())
        .run()
        .await
        .expect("first run");
    let replay = workflow(&scripted, trigger.clone(), substrate.clone())
        .run()
        .await
        .expect("replay");
    assert_eq!(replay, first);
    assert_eq!(scripted.analyzer.calls(), 1);

    let restarted = workflow(&scripted, trigger, substrate)
        .restart_finished(true)
        .run()
        .await
        .expect("restart");
    assert_eq!(restarted.iterations, 2);
    assert_eq!(scripted.analyzer.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_approval_wait() {
    let scripted = Scripted::fixing(PATH, BEFORE, AFTER);
    let substrate = Arc::new(LocalSubstrate::in_memory());
    let cancel = substrate.cancel_handle();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        cancel.cancel();
    });
    let run = workflow(&scripted, TriggerSpec::on_demand(), substrate.clone())
        .run()
        .await
        .expect("run");

    assert_eq!(run.outcome, CycleOutcome::Cancelled);
    assert_eq!(scripted.applier.calls(), 0);
    let reports = substrate.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome, CycleOutcome::Cancelled);
    let state = substrate.load().await.expect("load").expect("state");
    assert_eq!(state.stage, Stage::Done);
    assert!(!state.pending_approval);
}

/// Interval mode repeats cycles until cancelled during the inter-cycle sleep.
#[tokio::test(start_paused = true)]
async fn interval_repeats_until_cancelled_while_sleeping() {
    let scripted = Scripted::fixing(PATH, BEFORE, AFTER);
    let substrate = Arc::new(LocalSubstrate::in_memory());
    let cancel = substrate.cancel_handle();
    let trigger = TriggerSpec::interval(Duration::from_secs(3600)).with_auto_approve(true);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(90 * 60)).await;
        cancel.cancel();
    });
    let run = workflow(&scripted, trigger, substrate.clone())
        .run()
        .await
        .expect("run");

    assert_eq!(run.outcome, CycleOutcome::Cancelled);
    assert_eq!(run.iterations, 2);
    assert_eq!(scripted.applier.calls(), 2);
    // The cancelled sleep is not a cycle of its own.
    assert_eq!(substrate.reports().len(), 2);
}

/// An interval cycle that exhausts its retries backs off and the next cycle recovers.
#[tokio::test(start_paused = true)]
async fn interval_error_recovery_backs_off_then_recovers() {
    let retry = RetryPolicy::default();
    let scripted = Scripted::fixing(PATH, BEFORE, AFTER).with_analyzer(
        ScriptedAnalyzer::with_finding(PATH, BEFORE).failing_first(retry.max_attempts),
    );
    let substrate = Arc::new(LocalSubstrate::in_memory());
    let cancel = substrate.cancel_handle();
    let trigger = TriggerSpec::interval(Duration::from_secs(10 * 60)).with_auto_approve(true);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(15 * 60)).await;
        cancel.cancel();
    });
    let run = workflow(&scripted, trigger, substrate.clone())
        .with_settings(PipelineSettings {
            retry: retry.clone(),
            ..PipelineSettings::default()
        })
        .run()
        .await
        .expect("run");

    assert_eq!(run.outcome, CycleOutcome::Cancelled);
    let reports = substrate.reports();
    assert_eq!(reports.len(), 2);
    assert!(reports[0].outcome.is_failure());
    assert!(matches!(reports[1].outcome, CycleOutcome::Applied { .. }));
    assert_eq!(scripted.analyzer.calls(), retry.max_attempts + 1);
}

/// On-demand runs end with a failure outcome once an activity exhausts its retries.
#[tokio::test(start_paused = true)]
async fn on_demand_error_ends_run() {
    let scripted = Scripted::fixing(PATH, BEFORE, AFTER)
        .with_analyzer(ScriptedAnalyzer::with_finding(PATH, BEFORE).failing_first(100));
    let substrate = Arc::new(LocalSubstrate::in_memory());

    let run = workflow(&scripted, TriggerSpec::on_demand(), substrate.clone())
        .run()
        .await
        .expect("run");

    let CycleOutcome::Failed { error } = &run.outcome else {
        panic!("expected failure, got {:?}", run.outcome);
    };
    assert!(error.contains("analyze"));
    assert_eq!(scripted.analyzer.calls(), RetryPolicy::default().max_attempts);
    let state = substrate.load().await.expect("load").expect("state");
    assert_eq!(state.stage, Stage::Done);
}

/// An unreadable subject is not retried and stops even an interval workflow.
#[tokio::test(start_paused = true)]
async fn input_error_stops_interval_workflow() {
    let scripted =
        Scripted::fixing(PATH, BEFORE, AFTER).with_analyzer(ScriptedAnalyzer::unreadable());
    let substrate = Arc::new(LocalSubstrate::in_memory());
    let trigger = TriggerSpec::interval(Duration::from_secs(3600));

    let run = workflow(&scripted, trigger, substrate)
        .run()
        .await
        .expect("run");

    assert!(run.outcome.is_failure());
    assert_eq!(run.iterations, 1);
    assert_eq!(scripted.analyzer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn invalid_trigger_fails_without_running() {
    let scripted = Scripted::fixing(PATH, BEFORE, AFTER);
    let trigger = TriggerSpec::on_demand().with_approval_timeout(Duration::ZERO);

    let run = workflow(&scripted, trigger, Arc::new(LocalSubstrate::in_memory()))
        .run()
        .await
        .expect("run");

    assert!(run.outcome.is_failure());
    assert_eq!(run.iterations, 0);
    assert_eq!(scripted.analyzer.calls(), 0);
}
