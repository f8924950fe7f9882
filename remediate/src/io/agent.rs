//! Agent backend abstraction.
//!
//! [`AgentRunner`] decouples the analyze/propose collaborators from the agent
//! process (currently `codex exec`). Every response is validated against the
//! task's embedded JSON Schema before it is handed back. Tests use scripted
//! runners that return canned JSON without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use jsonschema::validator_for;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::ids::content_id;
use crate::io::atomic::write_atomic;
use crate::io::config::AgentConfig;
use crate::io::process::{ProcessRequest, run_argv};

/// The structured outputs the agent is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentTask {
    FileAnalysis,
    FileFix,
    ConfigAnalysis,
    ConfigUpdate,
}

impl AgentTask {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentTask::FileAnalysis => "file_analysis",
            AgentTask::FileFix => "file_fix",
            AgentTask::ConfigAnalysis => "config_analysis",
            AgentTask::ConfigUpdate => "config_update",
        }
    }

    pub fn schema(self) -> &'static str {
        match self {
            AgentTask::FileAnalysis => include_str!("../../schemas/file_analysis.schema.json"),
            AgentTask::FileFix => include_str!("../../schemas/file_fix.schema.json"),
            AgentTask::ConfigAnalysis => include_str!("../../schemas/config_analysis.schema.json"),
            AgentTask::ConfigUpdate => include_str!("../../schemas/config_update.schema.json"),
        }
    }
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run `task` with `prompt` and return the raw JSON response.
    async fn run(&self, task: AgentTask, prompt: &str) -> Result<Value>;
}

/// Run `task`, validate the response against its schema and deserialize it.
#[instrument(skip_all, fields(task = task.as_str()))]
pub async fn run_agent<T: DeserializeOwned>(
    agent: &dyn AgentRunner,
    task: AgentTask,
    prompt: &str,
) -> Result<T> {
    let value = agent.run(task, prompt).await?;
    validate_output(task, &value)?;
    serde_json::from_value(value).with_context(|| format!("deserialize {} output", task.as_str()))
}

/// Check `output` against the schema embedded for `task`.
pub fn validate_output(task: AgentTask, output: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(task.schema())
        .with_context(|| format!("parse {} schema", task.as_str()))?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    let messages: Vec<String> = compiled
        .iter_errors(output)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "{} output failed schema validation: {}",
            task.as_str(),
            messages.join("; ")
        ));
    }
    Ok(())
}

/// Runner that spawns the configured agent command.
///
/// Each invocation works in `scratch_dir/<task>-<prompt hash>/`, where the
/// schema, the response and a log of the process output are kept.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    config: AgentConfig,
    workdir: PathBuf,
    scratch_dir: PathBuf,
}

impl CommandAgent {
    pub fn new(config: AgentConfig, workdir: impl Into<PathBuf>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            workdir: workdir.into(),
            scratch_dir: scratch_dir.into(),
        }
    }

    fn request_dir(&self, task: AgentTask, prompt: &str) -> PathBuf {
        self.scratch_dir
            .join(format!("{}-{}", task.as_str(), content_id(prompt, 12)))
    }
}

#[async_trait]
impl AgentRunner for CommandAgent {
    #[instrument(skip_all, fields(task = task.as_str(), timeout_secs = self.config.timeout_secs))]
    async fn run(&self, task: AgentTask, prompt: &str) -> Result<Value> {
        let dir = self.request_dir(task, prompt);
        fs::create_dir_all(&dir).with_context(|| format!("create agent dir {}", dir.display()))?;
        let schema_path = dir.join("schema.json");
        let output_path = dir.join("output.json");
        let log_path = dir.join("agent.log");
        write_atomic(&schema_path, task.schema().as_bytes())?;
        if output_path.exists() {
            // A response left by an earlier attempt must not be mistaken for this one.
            fs::remove_file(&output_path)
                .with_context(|| format!("remove stale {}", output_path.display()))?;
        }

        let mut argv = self.config.command.clone();
        argv.push("--output-schema".to_string());
        argv.push(schema_path.to_string_lossy().into_owned());
        argv.push("--output-last-message".to_string());
        argv.push(output_path.to_string_lossy().into_owned());
        argv.push("-".to_string());

        info!(workdir = %self.workdir.display(), "starting agent");
        let output = run_argv(ProcessRequest {
            argv,
            workdir: self.workdir.clone(),
            stdin: Some(prompt.as_bytes().to_vec()),
            timeout: Duration::from_secs(self.config.timeout_secs),
            output_limit_bytes: self.config.output_limit_bytes,
        })
        .await?;
        write_atomic(&log_path, output.combined_text().as_bytes())?;

        if output.timed_out {
            warn!(timeout_secs = self.config.timeout_secs, "agent timed out");
            return Err(anyhow!("agent timed out after {}s", self.config.timeout_secs));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), log = %log_path.display(), "agent failed");
            return Err(anyhow!("agent failed with status {:?}", output.status.code()));
        }
        debug!("agent completed");
        read_output(&output_path)
    }
}

fn read_output(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Err(anyhow!("missing agent output {}", path.display()));
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read agent output {}", path.display()))?;
    serde_json::from_str(contents.trim()).with_context(|| format!("parse {}", path.display()))
}
