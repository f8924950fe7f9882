//! Approval-gated remediation CLI.
//!
//! `remediate fix` and `remediate audit` run a workflow in the foreground; the
//! other commands talk to a running (or finished) workflow through the files
//! under `.remediate/workflows/<id>/`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use remediate::core::categories::ConfigCategory;
use remediate::core::ids::{is_safe_id, workflow_id};
use remediate::core::state::WorkflowState;
use remediate::core::trigger::{Cadence, TriggerSpec};
use remediate::core::types::Subject;
use remediate::exit_codes;
use remediate::io::agent::{AgentRunner, CommandAgent};
use remediate::io::apply::FsApplier;
use remediate::io::config::{RemediateConfig, load_config};
use remediate::io::config_audit::{ConfigAnalyzer, ConfigLoader, ConfigProposer, ConfigValidator};
use remediate::io::file_fix::{CommandValidator, FileAnalyzer, FileFixProposer};
use remediate::io::init::{InitOptions, init_remediate};
use remediate::io::inbox::{clear_cancel, post_signal, request_cancel};
use remediate::io::journal::list_cycles;
use remediate::io::notify::JournalNotifier;
use remediate::io::paths::RemediatePaths;
use remediate::io::store::{list_workflows, load_workflow_state};
use remediate::io::substrate::LocalSubstrate;
use remediate::logging;
use remediate::workflow::collaborators::Collaborators;
use remediate::workflow::scheduler::{RunOutcome, Workflow};
use remediate::workflow::substrate::ApprovalSignal;

#[derive(Parser)]
#[command(
    name = "remediate",
    version,
    about = "Approval-gated code and configuration remediation"
)]
struct Cli {
    /// Repository root.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.remediate/config.toml` and the workflow directory.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Analyze one file, propose a fix and apply it once approved.
    Fix {
        /// File to fix, relative to the root.
        file: PathBuf,
        /// Extra guidance passed to the analyzer.
        #[arg(long)]
        hint: Option<String>,
        #[command(flatten)]
        approval: ApprovalArgs,
    },
    /// Audit tooling configuration and propose updates.
    Audit {
        /// Comma-separated config types (eslint, prettier, typescript, jest, husky).
        #[arg(long = "config-types", value_delimiter = ',', required = true)]
        config_types: Vec<ConfigCategory>,
        /// Repeat the audit on this cadence (per-commit runs once).
        #[arg(long)]
        cadence: Option<Cadence>,
        #[command(flatten)]
        approval: ApprovalArgs,
    },
    /// Approve or reject the pending proposal of a workflow.
    Signal {
        #[arg(value_enum)]
        decision: Decision,
        #[arg(long)]
        workflow: Option<String>,
        #[arg(long)]
        note: Option<String>,
    },
    /// Ask a running workflow to stop.
    Cancel {
        #[arg(long)]
        workflow: Option<String>,
    },
    /// Show workflow state.
    Status {
        #[arg(long)]
        workflow: Option<String>,
    },
}

#[derive(Args, Clone, Copy)]
struct ApprovalArgs {
    /// Skip the approval gate.
    #[arg(long)]
    auto_approve: bool,
    /// Override the configured approval timeout.
    #[arg(long)]
    approval_timeout_secs: Option<u64>,
}

impl ApprovalArgs {
    fn apply(self, trigger: TriggerSpec) -> TriggerSpec {
        let trigger = if self.auto_approve {
            trigger.with_auto_approve(true)
        } else {
            trigger
        };
        match self.approval_timeout_secs {
            Some(secs) => trigger.with_approval_timeout(Duration::from_secs(secs)),
            None => trigger,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum Decision {
    Approve,
    Reject,
}

fn main() {
    logging::init("warn");
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::ERROR);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let paths = RemediatePaths::new(&cli.root);
    match cli.command {
        Command::Init { force } => cmd_init(&cli.root, force),
        Command::Fix {
            file,
            hint,
            approval,
        } => {
            let cfg = load_config(&paths.config_path)?;
            let subject = Subject::file(relative_locator(&cli.root, &file)?);
            let trigger = approval.apply(cfg.on_demand_trigger()).with_hint(hint);
            run_workflow(&paths, &cfg, subject, trigger)
        }
        Command::Audit {
            config_types,
            cadence,
            approval,
        } => {
            let cfg = load_config(&paths.config_path)?;
            let subject = Subject::config(config_types);
            let cadence = cadence.unwrap_or(cfg.cadence);
            let trigger = approval.apply(cfg.cadence_trigger(cadence));
            run_workflow(&paths, &cfg, subject, trigger)
        }
        Command::Signal {
            decision,
            workflow,
            note,
        } => cmd_signal(&paths, workflow.as_deref(), decision, note),
        Command::Cancel { workflow } => cmd_cancel(&paths, workflow.as_deref()),
        Command::Status { workflow } => cmd_status(&paths, workflow.as_deref()),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_remediate(root, &InitOptions { force })?;
    println!("initialized {}", paths.state_dir.display());
    Ok(exit_codes::OK)
}

/// Subject locator for `file`: relative to `root`, `/`-separated.
fn relative_locator(root: &Path, file: &Path) -> Result<String> {
    let rel = if file.is_absolute() {
        let root = root
            .canonicalize()
            .with_context(|| format!("resolve root {}", root.display()))?;
        file.strip_prefix(&root)
            .map_err(|_| anyhow!("{} is outside {}", file.display(), root.display()))?
            .to_path_buf()
    } else {
        file.to_path_buf()
    };
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .filter(|c| c != ".")
        .collect();
    if parts.is_empty() {
        bail!("file path must name a file");
    }
    Ok(parts.join("/"))
}

fn collaborators(
    paths: &RemediatePaths,
    backups_dir: &Path,
    notifications_dir: &Path,
    cfg: &RemediateConfig,
    subject: &Subject,
) -> Collaborators {
    let root = paths.root.clone();
    let agent: Arc<dyn AgentRunner> = Arc::new(CommandAgent::new(
        cfg.agent.clone(),
        root.clone(),
        paths.agent_dir.clone(),
    ));
    let applier = Arc::new(FsApplier::new(root.clone(), backups_dir));
    let notifier = Arc::new(JournalNotifier::new(notifications_dir).with_console(true));
    match subject {
        Subject::File { .. } => Collaborators {
            analyzer: Arc::new(
                FileAnalyzer::new(root.clone(), cfg.checks.clone()).with_agent(agent.clone()),
            ),
            proposer: Arc::new(FileFixProposer::new(agent)),
            applier,
            validator: Arc::new(CommandValidator::new(root, cfg.checks.clone())),
            notifier,
        },
        Subject::Config { categories } => {
            let loader = ConfigLoader::new(root.clone());
            Collaborators {
                analyzer: Arc::new(ConfigAnalyzer::new(
                    root.clone(),
                    loader.clone(),
                    agent.clone(),
                )),
                proposer: Arc::new(ConfigProposer::new(categories.clone(), loader, agent)),
                applier,
                validator: Arc::new(ConfigValidator::new(root)),
                notifier,
            }
        }
    }
}

fn run_workflow(
    paths: &RemediatePaths,
    cfg: &RemediateConfig,
    subject: Subject,
    trigger: TriggerSpec,
) -> Result<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start tokio runtime")?;
    let outcome = runtime.block_on(async {
        let workflow_paths = paths.workflow(&workflow_id(&subject.locator()));
        clear_cancel(&workflow_paths.cancel_path)?;
        let collaborators = collaborators(
            paths,
            &workflow_paths.backups_dir,
            &workflow_paths.notifications_dir,
            cfg,
            &subject,
        );
        let substrate = Arc::new(LocalSubstrate::with_files(workflow_paths));
        let cancel = substrate.cancel_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; cancelling workflow");
                cancel.cancel();
            }
        });

        let workflow = Workflow::new(subject, trigger, collaborators, substrate)
            .with_settings(cfg.pipeline_settings())
            .restart_finished(true);
        eprintln!("workflow {}", workflow.workflow_id());
        workflow.run().await
    })?;
    Ok(report(&outcome))
}

fn report(outcome: &RunOutcome) -> i32 {
    info!(
        workflow_id = %outcome.workflow_id,
        iterations = outcome.iterations,
        "workflow finished"
    );
    println!("{}", outcome.message());
    exit_codes::for_outcome(&outcome.outcome)
}

/// Resolve which workflow a command addresses.
///
/// Without an explicit id: the only workflow awaiting approval, else the only
/// workflow at all.
fn resolve_workflow(paths: &RemediatePaths, explicit: Option<&str>) -> Result<WorkflowState> {
    if let Some(id) = explicit {
        if !is_safe_id(id) {
            bail!("invalid workflow id '{id}'");
        }
        return load_workflow_state(&paths.workflow(id).state_path)?
            .ok_or_else(|| anyhow!("no workflow '{id}' under {}", paths.workflows_dir.display()));
    }
    let workflows = list_workflows(&paths.workflows_dir)?;
    let pending: Vec<&WorkflowState> = workflows.iter().filter(|w| w.pending_approval).collect();
    if let [only] = pending.as_slice() {
        return Ok((*only).clone());
    }
    match workflows.as_slice() {
        [] => bail!("no workflows under {}", paths.workflows_dir.display()),
        [only] => Ok(only.clone()),
        many => {
            let ids: Vec<&str> = many.iter().map(|w| w.workflow_id.as_str()).collect();
            bail!(
                "several workflows found ({}); pass --workflow",
                ids.join(", ")
            )
        }
    }
}

fn cmd_signal(
    paths: &RemediatePaths,
    workflow: Option<&str>,
    decision: Decision,
    note: Option<String>,
) -> Result<i32> {
    let state = resolve_workflow(paths, workflow)?;
    if !state.pending_approval {
        warn!(workflow_id = %state.workflow_id, "workflow is not awaiting approval; signal will be discarded at the next gate entry");
    }
    let mut signal = match decision {
        Decision::Approve => ApprovalSignal::approve(),
        Decision::Reject => ApprovalSignal::reject(),
    };
    signal.note = note;
    let path = post_signal(&paths.workflow(&state.workflow_id).signals_dir, &signal)?;
    println!("signal written to {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_cancel(paths: &RemediatePaths, workflow: Option<&str>) -> Result<i32> {
    let state = resolve_workflow(paths, workflow)?;
    request_cancel(&paths.workflow(&state.workflow_id).cancel_path)?;
    println!("cancellation requested for {}", state.workflow_id);
    Ok(exit_codes::OK)
}

fn cmd_status(paths: &RemediatePaths, workflow: Option<&str>) -> Result<i32> {
    let states = match workflow {
        Some(_) => vec![resolve_workflow(paths, workflow)?],
        None => list_workflows(&paths.workflows_dir)?,
    };
    if states.is_empty() {
        println!("no workflows");
    }
    for state in &states {
        let cycles = list_cycles(&paths.workflow(&state.workflow_id).cycles_dir)?;
        println!("{}", status_line(state, cycles.len()));
    }
    Ok(exit_codes::OK)
}

fn status_line(state: &WorkflowState, journaled: usize) -> String {
    let mut line = format!(
        "{}  {}  stage={}  iteration={}  cycles={}",
        state.workflow_id,
        state.subject,
        state.stage.as_str(),
        state.iteration,
        journaled
    );
    if state.pending_approval {
        line.push_str("  awaiting-approval");
    }
    if let Some(wake_at) = state.wake_at {
        line.push_str(&format!("  wake_at={}", wake_at.to_rfc3339()));
    }
    if let Some(outcome) = &state.last_outcome {
        line.push_str(&format!("\n    {outcome}"));
    }
    line
}
