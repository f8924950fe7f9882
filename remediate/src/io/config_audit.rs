//! Collaborators for the tooling-configuration audit variant.
//!
//! Configs are located through the category table in
//! [`crate::core::categories`]. JSON configs are parsed directly, CommonJS
//! configs are evaluated with `node`, and husky hooks are read from their
//! script files into a `{ preCommit, prePush, commitMsg }` object. Proposed
//! updates are deep-merged into the loaded config and written back as JSON (or
//! as executable hook scripts).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::core::categories::{ConfigCategory, ConfigFormat, HUSKY_HOOKS};
use crate::core::merge::{deep_merge, diff_keys};
use crate::core::types::{
    ChangeProposal, Finding, FindingSet, Location, Severity, Subject, SubjectSnapshot,
    TargetChange, ValidationResult,
};
use crate::io::agent::{AgentRunner, AgentTask, run_agent};
use crate::io::process::{ProcessRequest, run_argv};
use crate::io::prompt::PromptEngine;
use crate::workflow::collaborators::{Analyzer, Proposer, Validator};
use crate::workflow::error::InputError;

const HOOK_PREAMBLE: &str = "#!/usr/bin/env sh\n. \"$(dirname -- \"$0\")/_/husky.sh\"\n";
const SOURCE_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx"];
const SKIP_DIRS: &[&str] = &["node_modules", ".git", ".remediate", "dist", "build", "coverage"];
const NODE_EVAL: &str = "console.log(JSON.stringify(require(require('path').resolve(process.argv[1]))))";

/// Categories of a config subject, or an input error for any other subject.
fn subject_categories(subject: &Subject) -> Result<&[ConfigCategory]> {
    match subject {
        Subject::Config { categories } if !categories.is_empty() => Ok(categories.as_slice()),
        Subject::Config { .. } => Err(InputError::new("no config types selected").into()),
        other => Err(InputError::new(format!(
            "config collaborators cannot handle subject {}",
            other.locator()
        ))
        .into()),
    }
}

/// Files a category's proposals are written to.
pub fn write_targets(category: ConfigCategory) -> Vec<&'static str> {
    match category {
        ConfigCategory::Husky => HUSKY_HOOKS.iter().map(|(_, path)| *path).collect(),
        other => vec![other.spec().write_path],
    }
}

/// Shell command a hook script runs, without the husky preamble.
pub fn hook_command(script: &str) -> String {
    script
        .lines()
        .filter(|line| !line.starts_with("#!") && !line.contains("husky.sh"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Full hook script for `command`.
pub fn hook_script(command: &str) -> String {
    format!("{HOOK_PREAMBLE}\n{}\n", command.trim())
}

/// A category's current configuration and where it was read from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadedConfig {
    pub source: String,
    pub value: Value,
}

/// Reads current configuration for a set of categories.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    root: PathBuf,
    node_command: Vec<String>,
    timeout: Duration,
}

impl ConfigLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            node_command: vec!["node".to_string()],
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_node_command(mut self, command: Vec<String>) -> Self {
        self.node_command = command;
        self
    }

    /// Load every category that has a config. Categories that fail to load are
    /// skipped with a warning.
    #[instrument(skip_all, fields(categories = categories.len()))]
    pub async fn load(&self, categories: &[ConfigCategory]) -> BTreeMap<ConfigCategory, LoadedConfig> {
        let mut loaded = BTreeMap::new();
        for &category in categories {
            match self.load_one(category).await {
                Ok(Some(config)) => {
                    debug!(category = category.as_str(), source = %config.source, "config loaded");
                    loaded.insert(category, config);
                }
                Ok(None) => debug!(category = category.as_str(), "no config found"),
                Err(err) => warn!(
                    category = category.as_str(),
                    err = %format!("{err:#}"),
                    "failed to load config; skipping"
                ),
            }
        }
        loaded
    }

    async fn load_one(&self, category: ConfigCategory) -> Result<Option<LoadedConfig>> {
        let Some((source, format)) = category
            .spec()
            .candidates
            .iter()
            .find(|(path, _)| self.root.join(path).exists())
        else {
            return Ok(None);
        };
        let path = self.root.join(source);
        let value = match format {
            ConfigFormat::Json => read_json_config(&path)?,
            ConfigFormat::JsModule => self.eval_module(source).await?,
            ConfigFormat::HookScripts => {
                let hooks = read_hooks(&self.root)?;
                if hooks.is_empty() {
                    return Ok(None);
                }
                Value::Object(hooks)
            }
        };
        Ok(Some(LoadedConfig {
            source: source.to_string(),
            value,
        }))
    }

    async fn eval_module(&self, source: &str) -> Result<Value> {
        let mut argv = self.node_command.clone();
        argv.extend(["-e".to_string(), NODE_EVAL.to_string(), source.to_string()]);
        let output = run_argv(ProcessRequest {
            argv,
            workdir: self.root.clone(),
            stdin: None,
            timeout: self.timeout,
            output_limit_bytes: 1_000_000,
        })
        .await?;
        if !output.success() {
            return Err(anyhow!(
                "evaluate {source} failed: {}",
                output.combined_text().trim()
            ));
        }
        serde_json::from_str(output.stdout_text().trim())
            .with_context(|| format!("parse evaluated {source}"))
    }
}

fn read_json_config(path: &Path) -> Result<Value> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn read_hooks(root: &Path) -> Result<Map<String, Value>> {
    let mut hooks = Map::new();
    for (name, rel) in HUSKY_HOOKS {
        let path = root.join(rel);
        if !path.exists() {
            continue;
        }
        let script =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        hooks.insert(name.to_string(), Value::String(hook_command(&script)));
    }
    Ok(hooks)
}

/// Size and dependency summary of the repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectStats {
    pub file_count: usize,
    pub line_count: usize,
    pub package_count: usize,
    pub dependencies: BTreeMap<String, String>,
    pub dev_dependencies: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageJson {
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
    #[serde(default)]
    dev_dependencies: BTreeMap<String, String>,
}

impl ProjectStats {
    /// Walk `root`, skipping dependency and build directories.
    pub fn collect(root: &Path) -> Result<Self> {
        let mut stats = ProjectStats::default();
        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            entry.depth() == 0
                || !(entry.file_type().is_dir()
                    && entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| SKIP_DIRS.contains(&name)))
        });
        for entry in walker {
            let entry = entry.context("walk repository")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if entry.file_name() == "package.json" {
                stats.package_count += 1;
                continue;
            }
            let is_source = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext));
            if is_source {
                stats.file_count += 1;
                // Non-UTF-8 sources still count as files.
                if let Ok(contents) = fs::read_to_string(path) {
                    stats.line_count += contents.lines().count();
                }
            }
        }

        let package_path = root.join("package.json");
        if package_path.exists() {
            let package: PackageJson = serde_json::from_str(
                &fs::read_to_string(&package_path)
                    .with_context(|| format!("read {}", package_path.display()))?,
            )
            .with_context(|| format!("parse {}", package_path.display()))?;
            stats.dependencies = package.dependencies;
            stats.dev_dependencies = package.dev_dependencies;
        }
        Ok(stats)
    }
}

/// Current content of every file the categories write to; missing files are empty.
fn snapshot(root: &Path, categories: &[ConfigCategory]) -> Result<SubjectSnapshot> {
    let mut targets = BTreeMap::new();
    for &category in categories {
        for rel in write_targets(category) {
            let path = root.join(rel);
            let content = if path.exists() {
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?
            } else {
                String::new()
            };
            targets.insert(rel.to_string(), content);
        }
    }
    Ok(SubjectSnapshot { targets })
}

fn config_values(loaded: &BTreeMap<ConfigCategory, LoadedConfig>) -> BTreeMap<&'static str, &Value> {
    loaded
        .iter()
        .map(|(category, config)| (category.as_str(), &config.value))
        .collect()
}

#[derive(Debug, Deserialize)]
struct AnalysisOutput {
    recommendations: Vec<Recommendation>,
}

#[derive(Debug, Deserialize)]
struct Recommendation {
    config_type: ConfigCategory,
    reason: String,
    severity: Severity,
}

/// Asks the agent for configuration recommendations.
pub struct ConfigAnalyzer {
    root: PathBuf,
    loader: ConfigLoader,
    agent: Arc<dyn AgentRunner>,
}

impl ConfigAnalyzer {
    pub fn new(root: impl Into<PathBuf>, loader: ConfigLoader, agent: Arc<dyn AgentRunner>) -> Self {
        Self {
            root: root.into(),
            loader,
            agent,
        }
    }
}

#[async_trait]
impl Analyzer for ConfigAnalyzer {
    #[instrument(skip_all, fields(subject = %subject.locator()))]
    async fn analyze(&self, subject: &Subject, hint: Option<&str>) -> Result<FindingSet> {
        let categories = subject_categories(subject)?;
        let loaded = self.loader.load(categories).await;
        let root = self.root.clone();
        let stats = tokio::task::spawn_blocking(move || ProjectStats::collect(&root))
            .await
            .context("join project stats")??;
        debug!(files = stats.file_count, lines = stats.line_count, packages = stats.package_count, "project stats collected");

        let names: Vec<&str> = categories.iter().map(|c| c.as_str()).collect();
        let prompt = PromptEngine::new()?.config_analysis(&names, &stats, &config_values(&loaded), hint)?;
        let output: AnalysisOutput =
            run_agent(self.agent.as_ref(), AgentTask::ConfigAnalysis, &prompt).await?;

        let findings: Vec<Finding> = output
            .recommendations
            .into_iter()
            .filter(|rec| categories.contains(&rec.config_type))
            .map(|rec| Finding {
                kind: format!("config:{}", rec.config_type),
                description: rec.reason,
                location: Some(Location {
                    path: rec.config_type.spec().write_path.to_string(),
                    line: None,
                    column: None,
                }),
                severity: rec.severity,
            })
            .collect();
        info!(recommendations = findings.len(), "configuration analyzed");
        Ok(FindingSet {
            findings,
            snapshot: snapshot(&self.root, categories)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct UpdateOutput {
    updates: Vec<ConfigUpdate>,
}

#[derive(Debug, Deserialize)]
struct ConfigUpdate {
    config_type: ConfigCategory,
    config: Value,
    reason: String,
}

/// Turns recommendations into merged configuration targets.
pub struct ConfigProposer {
    categories: Vec<ConfigCategory>,
    loader: ConfigLoader,
    agent: Arc<dyn AgentRunner>,
}

impl ConfigProposer {
    pub fn new(categories: Vec<ConfigCategory>, loader: ConfigLoader, agent: Arc<dyn AgentRunner>) -> Self {
        Self {
            categories,
            loader,
            agent,
        }
    }
}

#[async_trait]
impl Proposer for ConfigProposer {
    #[instrument(skip_all, fields(findings = findings.findings.len()))]
    async fn propose(
        &self,
        findings: &FindingSet,
        current: &SubjectSnapshot,
    ) -> Result<ChangeProposal> {
        let loaded = self.loader.load(&self.categories).await;
        let prompt = PromptEngine::new()?.config_update(&findings.findings, &config_values(&loaded))?;
        let output: UpdateOutput =
            run_agent(self.agent.as_ref(), AgentTask::ConfigUpdate, &prompt).await?;

        // Several updates for one category are applied in order.
        let mut per_category: BTreeMap<ConfigCategory, (Value, Vec<String>)> = BTreeMap::new();
        for update in output.updates {
            if !self.categories.contains(&update.config_type) {
                warn!(category = update.config_type.as_str(), "ignoring update for unselected config type");
                continue;
            }
            let entry = per_category
                .entry(update.config_type)
                .or_insert_with(|| (Value::Object(Map::new()), Vec::new()));
            entry.0 = deep_merge(&entry.0, &update.config);
            entry.1.push(update.reason);
        }

        let mut targets = BTreeMap::new();
        let mut updated = Vec::new();
        for (category, (update, reasons)) in per_category {
            let base = loaded
                .get(&category)
                .map(|c| c.value.clone())
                .unwrap_or_else(|| Value::Object(Map::new()));
            let merged = deep_merge(&base, &update);
            let reason = reasons.join("; ");
            let diffs = diff_keys(&base, &merged, &update, |_| Some(reason.clone()));
            if diffs.is_empty() {
                continue;
            }
            updated.push(category.as_str());
            let current_of = |rel: &str| current.get(rel).unwrap_or_default().to_string();

            if category == ConfigCategory::Husky {
                for (hook, rel) in HUSKY_HOOKS {
                    let Some(command) = merged.get(*hook).and_then(Value::as_str) else {
                        continue;
                    };
                    targets.insert(
                        rel.to_string(),
                        TargetChange {
                            current: current_of(*rel),
                            new: hook_script(command),
                            diffs: diffs.iter().filter(|d| d.path == *hook).cloned().collect(),
                            executable: true,
                        },
                    );
                }
            } else {
                let rel = category.spec().write_path;
                let mut new = serde_json::to_string_pretty(&merged).context("serialize config")?;
                new.push('\n');
                targets.insert(
                    rel.to_string(),
                    TargetChange {
                        current: current_of(rel),
                        new,
                        diffs,
                        executable: false,
                    },
                );
            }
        }

        let summary = if updated.is_empty() {
            "no configuration updates".to_string()
        } else {
            format!("update {} configuration", updated.join(", "))
        };
        Ok(ChangeProposal::new(summary, targets))
    }
}

/// Checks that written configs parse and hook scripts are executable.
pub struct ConfigValidator {
    root: PathBuf,
}

impl ConfigValidator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn check(&self, categories: &[ConfigCategory]) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        for &category in categories {
            if category == ConfigCategory::Husky {
                for (_, rel) in HUSKY_HOOKS {
                    let path = self.root.join(rel);
                    if path.exists() && !is_executable(&path) {
                        errors.push(format!("{rel} is not executable"));
                    }
                }
                continue;
            }
            let spec = category.spec();
            let written = self.root.join(spec.write_path);
            if written.exists() {
                if let Err(err) = read_json_config(&written) {
                    errors.push(format!("{category}: {err:#}"));
                }
            } else if !spec.candidates.iter().any(|(p, _)| self.root.join(p).exists()) {
                warnings.push(format!("no {category} config found"));
            }
            let shadow = spec
                .candidates
                .iter()
                .take_while(|(p, _)| *p != spec.write_path)
                .find(|(p, _)| self.root.join(p).exists())
                .filter(|_| written.exists());
            if let Some((shadow, _)) = shadow {
                warnings.push(format!("{shadow} takes precedence over {}", spec.write_path));
            }
        }
        if errors.is_empty() {
            ValidationResult::passed(warnings)
        } else {
            ValidationResult {
                success: false,
                error: Some(errors.join("; ")),
                warnings,
            }
        }
    }
}

#[async_trait]
impl Validator for ConfigValidator {
    #[instrument(skip_all, fields(subject = %subject.locator()))]
    async fn validate(&self, subject: &Subject) -> Result<ValidationResult> {
        let categories = subject_categories(subject)?;
        Ok(self.check(categories))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).is_ok_and(|m| m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.exists()
}
