//! Canonical paths within `.remediate/`.

use std::path::{Component, Path, PathBuf};

/// Repository-level paths for a project root.
#[derive(Debug, Clone)]
pub struct RemediatePaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
    pub workflows_dir: PathBuf,
    /// Scratch space for agent requests and responses.
    pub agent_dir: PathBuf,
}

impl RemediatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".remediate");
        Self {
            root: root.clone(),
            state_dir: state_dir.clone(),
            config_path: state_dir.join("config.toml"),
            gitignore_path: state_dir.join(".gitignore"),
            workflows_dir: state_dir.join("workflows"),
            agent_dir: state_dir.join("agent"),
        }
    }

    pub fn workflow(&self, workflow_id: &str) -> WorkflowPaths {
        WorkflowPaths::new(&self.workflows_dir, workflow_id)
    }
}

/// Paths owned by one workflow instance.
#[derive(Debug, Clone)]
pub struct WorkflowPaths {
    pub dir: PathBuf,
    pub state_path: PathBuf,
    pub signals_dir: PathBuf,
    pub cancel_path: PathBuf,
    pub notifications_dir: PathBuf,
    pub cycles_dir: PathBuf,
    pub backups_dir: PathBuf,
}

impl WorkflowPaths {
    pub fn new(workflows_dir: &Path, workflow_id: &str) -> Self {
        let dir = workflows_dir.join(workflow_id);
        let signals_dir = dir.join("signals");
        Self {
            state_path: dir.join("state.json"),
            cancel_path: signals_dir.join("cancel"),
            signals_dir,
            notifications_dir: dir.join("notifications"),
            cycles_dir: dir.join("cycles"),
            backups_dir: dir.join("backups"),
            dir,
        }
    }

    pub fn cycle_dir(&self, iteration: u32) -> PathBuf {
        self.cycles_dir.join(iteration.to_string())
    }

    pub fn backup_dir(&self, proposal_id: &str) -> PathBuf {
        self.backups_dir.join(proposal_id)
    }

    pub fn notification_path(&self, key: &str) -> PathBuf {
        self.notifications_dir.join(format!("{key}.json"))
    }
}

/// Join a repository-relative target onto `root`.
///
/// Returns `None` for absolute paths, `..` components and anything inside
/// `.remediate/`, so a proposal can never write outside the working tree or
/// into workflow state.
pub fn resolve_target(root: &Path, target: &str) -> Option<PathBuf> {
    let relative = Path::new(target);
    let mut normal = relative.components().filter_map(|component| match component {
        Component::Normal(name) => Some(Ok(name)),
        Component::CurDir => None,
        _ => Some(Err(())),
    });
    match normal.next() {
        Some(Ok(first)) if first != ".remediate" => {}
        _ => return None,
    }
    if normal.any(|component| component.is_err()) {
        return None;
    }
    Some(root.join(relative))
}
