//! Configuration stored under `.remediate/config.toml`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;
use crate::core::trigger::{Cadence, TriggerSpec};
use crate::io::atomic::write_atomic;
use crate::workflow::gate::MAX_POLL_INTERVAL;
use crate::workflow::pipeline::PipelineSettings;

/// Remediation configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields take the
/// defaults below; CLI flags override individual values per run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemediateConfig {
    /// How long a gate waits for a decision before timing out.
    pub approval_timeout_secs: u64,

    /// Gate poll interval. Must be in `1..=1000`.
    pub poll_interval_ms: u64,

    /// Cadence of `remediate audit` when none is given on the command line.
    pub cadence: Cadence,

    pub auto_approve: bool,

    /// Send a cycle report through the notifier after every cycle.
    pub notify_final: bool,

    pub retry: RetryPolicy,

    pub agent: AgentConfig,

    pub checks: CheckConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent command prefix. `--output-schema`, `--output-last-message` and `-`
    /// are appended; the prompt is written to stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "codex".to_string(),
                "exec".to_string(),
                "--sandbox".to_string(),
                "read-only".to_string(),
                "--skip-git-repo-check".to_string(),
            ],
            timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

/// Commands used to find issues in a file and to validate a fix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CheckConfig {
    /// Lint command; the file path is appended.
    pub lint_command: Vec<String>,
    /// Type-check command for files with `typecheck_extensions`; the file path is appended.
    pub typecheck_command: Vec<String>,
    pub typecheck_extensions: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for CheckConfig {
    fn default() -> Self {
        let argv = |args: &[&str]| args.iter().map(|s| s.to_string()).collect();
        Self {
            lint_command: argv(&["npx", "eslint", "--format", "unix"]),
            typecheck_command: argv(&["npx", "tsc", "--noEmit", "--pretty", "false"]),
            typecheck_extensions: argv(&["ts", "tsx"]),
            timeout_secs: 5 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for RemediateConfig {
    fn default() -> Self {
        Self {
            approval_timeout_secs: 24 * 60 * 60,
            poll_interval_ms: 1000,
            cadence: Cadence::default(),
            auto_approve: false,
            notify_final: true,
            retry: RetryPolicy::default(),
            agent: AgentConfig::default(),
            checks: CheckConfig::default(),
        }
    }
}

impl RemediateConfig {
    pub fn validate(&self) -> Result<()> {
        if self.approval_timeout_secs == 0 {
            return Err(anyhow!("approval_timeout_secs must be > 0"));
        }
        let max_poll_ms = MAX_POLL_INTERVAL.as_millis() as u64;
        if self.poll_interval_ms == 0 || self.poll_interval_ms > max_poll_ms {
            return Err(anyhow!("poll_interval_ms must be in 1..={max_poll_ms}"));
        }
        self.retry.validate()?;
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 || self.checks.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.checks.lint_command.is_empty() || self.checks.lint_command[0].trim().is_empty() {
            return Err(anyhow!("checks.lint_command must be a non-empty array"));
        }
        if self.checks.timeout_secs == 0 {
            return Err(anyhow!("checks.timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            retry: self.retry.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            notify_final: self.notify_final,
        }
    }

    /// Trigger for an on-demand run, before CLI overrides.
    pub fn on_demand_trigger(&self) -> TriggerSpec {
        TriggerSpec::on_demand()
            .with_auto_approve(self.auto_approve)
            .with_approval_timeout(self.approval_timeout())
    }

    /// Trigger for a periodic run at `cadence`, before CLI overrides.
    pub fn cadence_trigger(&self, cadence: Cadence) -> TriggerSpec {
        TriggerSpec::from_cadence(cadence)
            .with_auto_approve(self.auto_approve)
            .with_approval_timeout(self.approval_timeout())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RemediateConfig::default()`.
pub fn load_config(path: &Path) -> Result<RemediateConfig> {
    if !path.exists() {
        let cfg = RemediateConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RemediateConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RemediateConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RemediateConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = RemediateConfig {
            cadence: Cadence::Daily,
            auto_approve: true,
            ..RemediateConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "cadence = \"monthly\"\n[retry]\nmax_attempts = 5\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.cadence, Cadence::Monthly);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.approval_timeout_secs, 86_400);
    }

    #[test]
    fn poll_interval_above_one_second_is_rejected() {
        let cfg = RemediateConfig {
            poll_interval_ms: 5000,
            ..RemediateConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
