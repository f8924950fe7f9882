//! Cycle journal under `workflows/<id>/cycles/<iteration>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::outcome::{CycleOutcome, CycleReport};
use crate::io::atomic::{read_json, write_json};

/// Compact per-cycle summary (`meta.json`).
#[derive(Debug, Clone, Serialize)]
pub struct CycleMeta<'a> {
    pub workflow_id: &'a str,
    pub iteration: u32,
    pub started_at: Option<String>,
    pub finished_at: String,
    pub findings: usize,
    pub proposal_id: Option<&'a str>,
    pub outcome: &'a CycleOutcome,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct CyclePaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub report_path: PathBuf,
    pub findings_path: PathBuf,
    pub proposal_path: PathBuf,
    pub apply_path: PathBuf,
    pub validation_path: PathBuf,
}

impl CyclePaths {
    pub fn new(cycles_dir: &Path, iteration: u32) -> Self {
        let dir = cycles_dir.join(iteration.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            report_path: dir.join("report.json"),
            findings_path: dir.join("findings.json"),
            proposal_path: dir.join("proposal.json"),
            apply_path: dir.join("apply.json"),
            validation_path: dir.join("validation.json"),
            dir,
        }
    }
}

pub fn write_cycle(cycles_dir: &Path, report: &CycleReport) -> Result<CyclePaths> {
    let paths = CyclePaths::new(cycles_dir, report.iteration);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create cycle dir {}", paths.dir.display()))?;

    let meta = CycleMeta {
        workflow_id: &report.workflow_id,
        iteration: report.iteration,
        started_at: report.started_at.map(|t| t.to_rfc3339()),
        finished_at: report.finished_at.to_rfc3339(),
        findings: report.findings.len(),
        proposal_id: report.proposal.as_ref().map(|p| p.id()),
        outcome: &report.outcome,
        message: report.outcome.message(),
    };
    // Write in deterministic order to keep journals stable.
    write_json(&paths.meta_path, &meta)?;
    write_json(&paths.report_path, report)?;
    write_json(&paths.findings_path, &report.findings)?;
    if let Some(proposal) = &report.proposal {
        write_json(&paths.proposal_path, proposal)?;
    }
    if let Some(apply) = &report.apply {
        write_json(&paths.apply_path, apply)?;
    }
    if let Some(validation) = &report.validation {
        write_json(&paths.validation_path, validation)?;
    }
    Ok(paths)
}

/// Iterations with a recorded report, ascending.
pub fn list_cycles(cycles_dir: &Path) -> Result<Vec<u32>> {
    if !cycles_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut iterations = Vec::new();
    for entry in
        fs::read_dir(cycles_dir).with_context(|| format!("read {}", cycles_dir.display()))?
    {
        let entry = entry.with_context(|| format!("read {}", cycles_dir.display()))?;
        let Some(iteration) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        if entry.path().join("report.json").is_file() {
            iterations.push(iteration);
        }
    }
    iterations.sort_unstable();
    Ok(iterations)
}

pub fn load_cycle(cycles_dir: &Path, iteration: u32) -> Result<CycleReport> {
    read_json(&CyclePaths::new(cycles_dir, iteration).report_path)
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::core::types::ChangeProposal;

    fn report(iteration: u32, outcome: CycleOutcome) -> CycleReport {
        CycleReport {
            workflow_id: "wf-1".to_string(),
            iteration,
            started_at: Some(DateTime::<Utc>::UNIX_EPOCH),
            finished_at: DateTime::<Utc>::UNIX_EPOCH,
            findings: Vec::new(),
            proposal: Some(ChangeProposal::none()),
            decision: None,
            apply: None,
            validation: None,
            outcome,
        }
    }

    #[test]
    fn writes_only_present_sections() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = write_cycle(temp.path(), &report(1, CycleOutcome::NoUpdates)).expect("write");

        assert!(paths.dir.ends_with("1"));
        assert!(paths.meta_path.is_file());
        assert!(paths.findings_path.is_file());
        assert!(paths.proposal_path.is_file());
        assert!(!paths.apply_path.exists());
        assert!(!paths.validation_path.exists());

        let meta = fs::read_to_string(&paths.meta_path).expect("read meta");
        assert!(meta.contains("No updates needed at this time."));
    }

    #[test]
    fn lists_and_loads_recorded_cycles() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_cycle(temp.path(), &report(2, CycleOutcome::TimedOut)).expect("write 2");
        write_cycle(temp.path(), &report(1, CycleOutcome::NoIssues)).expect("write 1");
        fs::create_dir_all(temp.path().join("3")).expect("incomplete cycle");

        assert_eq!(list_cycles(temp.path()).expect("list"), vec![1, 2]);
        let loaded = load_cycle(temp.path(), 2).expect("load");
        assert_eq!(loaded.outcome, CycleOutcome::TimedOut);
    }
}
