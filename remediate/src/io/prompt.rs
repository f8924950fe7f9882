//! Prompt builder for agent-backed collaborators.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::Finding;

const FILE_ANALYSIS_TEMPLATE: &str = include_str!("prompts/file_analysis.md");
const FILE_FIX_TEMPLATE: &str = include_str!("prompts/file_fix.md");
const CONFIG_ANALYSIS_TEMPLATE: &str = include_str!("prompts/config_analysis.md");
const CONFIG_UPDATE_TEMPLATE: &str = include_str!("prompts/config_update.md");

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("file_analysis", FILE_ANALYSIS_TEMPLATE)
            .context("load file_analysis template")?;
        env.add_template("file_fix", FILE_FIX_TEMPLATE)
            .context("load file_fix template")?;
        env.add_template("config_analysis", CONFIG_ANALYSIS_TEMPLATE)
            .context("load config_analysis template")?;
        env.add_template("config_update", CONFIG_UPDATE_TEMPLATE)
            .context("load config_update template")?;
        Ok(Self { env })
    }

    pub fn file_analysis(
        &self,
        path: &str,
        content: &str,
        hint: Option<&str>,
        diagnostics: &[Finding],
    ) -> Result<String> {
        let diagnostics = diagnostics
            .iter()
            .map(describe_finding)
            .collect::<Vec<_>>()
            .join("\n");
        let rendered = self.env.get_template("file_analysis")?.render(context! {
            path => path,
            content => content.trim_end(),
            hint => hint.map(str::trim).filter(|s| !s.is_empty()),
            diagnostics => (!diagnostics.is_empty()).then_some(diagnostics),
        })?;
        Ok(rendered)
    }

    pub fn file_fix(&self, path: &str, content: &str, issues: &[Finding]) -> Result<String> {
        let rendered = self.env.get_template("file_fix")?.render(context! {
            path => path,
            content => content.trim_end(),
            issues => pretty_json(issues)?,
        })?;
        Ok(rendered)
    }

    pub fn config_analysis(
        &self,
        categories: &[&str],
        stats: &impl Serialize,
        configs: &impl Serialize,
        hint: Option<&str>,
    ) -> Result<String> {
        let rendered = self.env.get_template("config_analysis")?.render(context! {
            categories => categories.join(", "),
            stats => pretty_json(stats)?,
            configs => pretty_json(configs)?,
            hint => hint.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }

    pub fn config_update(
        &self,
        recommendations: &[Finding],
        configs: &impl Serialize,
    ) -> Result<String> {
        let rendered = self.env.get_template("config_update")?.render(context! {
            recommendations => pretty_json(recommendations)?,
            configs => pretty_json(configs)?,
        })?;
        Ok(rendered)
    }
}

fn pretty_json(value: &(impl Serialize + ?Sized)) -> Result<String> {
    serde_json::to_string_pretty(value).context("serialize prompt input")
}

fn describe_finding(finding: &Finding) -> String {
    let position = finding
        .location
        .as_ref()
        .map(|l| match (l.line, l.column) {
            (Some(line), Some(col)) => format!("{}:{line}:{col}", l.path),
            (Some(line), None) => format!("{}:{line}", l.path),
            _ => l.path.clone(),
        })
        .unwrap_or_default();
    format!(
        "{position} {} {} ({})",
        finding.severity.as_str(),
        finding.description,
        finding.kind
    )
    .trim()
    .to_string()
}
