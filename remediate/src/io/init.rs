//! Initialization helpers for `.remediate/` scaffolding.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};

use crate::io::config::{RemediateConfig, write_config};
use crate::io::paths::RemediatePaths;

/// Options for `init_remediate`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config and `.gitignore`.
    pub force: bool,
}

/// Create `.remediate/` scaffolding in `root`.
///
/// Fails if `.remediate/config.toml` already exists unless `options.force` is
/// set. Workflow state is never touched.
pub fn init_remediate(root: &Path, options: &InitOptions) -> Result<RemediatePaths> {
    let paths = RemediatePaths::new(root);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!(
            "remediate init: .remediate exists but is not a directory"
        ));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "remediate init: .remediate/config.toml already exists (use --force to overwrite)"
        ));
    }

    fs::create_dir_all(&paths.workflows_dir)
        .with_context(|| format!("create directory {}", paths.workflows_dir.display()))?;
    write_config(&paths.config_path, &RemediateConfig::default())?;
    fs::write(&paths.gitignore_path, REMEDIATE_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;

    Ok(paths)
}

/// Workflow state, backups and agent scratch files stay out of version control.
const REMEDIATE_GITIGNORE: &str = "workflows/\nagent/\n";
