//! CLI tests for the `remediate` binary.
//!
//! Spawns the binary against a temporary repository and checks exit codes and
//! the files it leaves under `.remediate/`.

use std::process::Command;

use remediate::core::state::{Stage, WorkflowState};
use remediate::exit_codes;
use remediate::io::config::{RemediateConfig, write_config};
use remediate::io::init::{InitOptions, init_remediate};
use remediate::io::paths::RemediatePaths;
use remediate::io::store::write_workflow_state;
use remediate::test_support::temp_repo;

fn remediate(root: &std::path::Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_remediate"));
    cmd.arg("--root").arg(root).env("RUST_LOG", "off");
    cmd
}

#[test]
fn init_then_status_reports_no_workflows() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = remediate(temp.path())
        .arg("init")
        .status()
        .expect("remediate init");
    assert_eq!(status.code(), Some(exit_codes::OK));
    assert!(RemediatePaths::new(temp.path()).config_path.is_file());

    let again = remediate(temp.path())
        .arg("init")
        .status()
        .expect("remediate init again");
    assert_eq!(again.code(), Some(exit_codes::ERROR));

    let output = remediate(temp.path())
        .arg("status")
        .output()
        .expect("remediate status");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&output.stdout).contains("no workflows"));
}

#[test]
fn signal_without_workflow_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_remediate(temp.path(), &InitOptions { force: false }).expect("init");

    let status = remediate(temp.path())
        .args(["signal", "approve"])
        .status()
        .expect("remediate signal");
    assert_eq!(status.code(), Some(exit_codes::ERROR));
}

#[test]
fn cancel_writes_marker_for_the_only_workflow() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_remediate(temp.path(), &InitOptions { force: false }).expect("init");
    let mut state = WorkflowState::new("wf-1", "fix:src/app.ts");
    state.stage = Stage::Sleeping;
    write_workflow_state(&paths.workflow("wf-1").state_path, &state).expect("state");

    let status = remediate(temp.path())
        .arg("cancel")
        .status()
        .expect("remediate cancel");
    assert_eq!(status.code(), Some(exit_codes::OK));
    assert!(paths.workflow("wf-1").cancel_path.exists());
}

/// Agent stand-in: answers the fix schema with a fixed file and anything else
/// with one issue. Positional args after `sh -c` are
/// `--output-schema <schema> --output-last-message <output> -`.
#[cfg(unix)]
const AGENT_SCRIPT: &str = r#"cat >/dev/null
if grep -q fixed_code "$1"; then
  printf '%s' '{"fixed_code":"const x = 1;\n","explanation":"prefer const","changes":[{"line":1,"description":"let to const"}]}' > "$3"
else
  printf '%s' '{"issues":[{"type":"style","description":"prefer const","line":1,"column":null,"severity":"error"}]}' > "$3"
fi
"#;

#[cfg(unix)]
#[test]
fn fix_with_auto_approve_rewrites_file() {
    let repo = temp_repo(&[("src/app.ts", "let x = 1\n")]);
    let paths = init_remediate(repo.path(), &InitOptions { force: false }).expect("init");
    let mut cfg = RemediateConfig::default();
    cfg.agent.command = vec!["sh".into(), "-c".into(), AGENT_SCRIPT.into()];
    cfg.checks.lint_command = vec!["true".into()];
    cfg.checks.typecheck_extensions = Vec::new();
    write_config(&paths.config_path, &cfg).expect("config");

    let output = remediate(repo.path())
        .args(["fix", "src/app.ts", "--auto-approve"])
        .output()
        .expect("remediate fix");

    assert_eq!(
        output.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("Successfully applied"));
    assert_eq!(
        std::fs::read_to_string(repo.path().join("src/app.ts")).expect("read"),
        "const x = 1;\n"
    );

    let status = remediate(repo.path())
        .arg("status")
        .output()
        .expect("remediate status");
    let text = String::from_utf8_lossy(&status.stdout);
    assert!(text.contains("fix:src/app.ts"));
    assert!(text.contains("stage=done"));
}
