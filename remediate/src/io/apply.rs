//! Filesystem applier.
//!
//! Every target is backed up once per proposal under
//! `backups/<proposal-id>/<target>` and then replaced with its full new content
//! through a temp-file rename. A proposal id covers the pre-apply content, so
//! the same change proposed against different content gets a fresh backup.
//! Re-running the same proposal after a partial failure keeps the first backup
//! and rewrites the same bytes. A target whose content changed since the
//! proposal was made is left alone and reported as failed.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::core::types::{
    ApplyResult, ChangeProposal, Subject, TargetApplyResult, TargetChange,
};
use crate::io::atomic::write_atomic;
use crate::io::paths::resolve_target;
use crate::workflow::collaborators::Applier;

/// Suffix of the marker recorded when a target did not exist before apply.
pub const ABSENT_SUFFIX: &str = ".absent";

pub struct FsApplier {
    root: PathBuf,
    backups_dir: PathBuf,
}

impl FsApplier {
    pub fn new(root: impl Into<PathBuf>, backups_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            backups_dir: backups_dir.into(),
        }
    }
}

#[async_trait]
impl Applier for FsApplier {
    #[instrument(skip_all, fields(proposal_id = proposal.id(), subject = %subject.locator()))]
    async fn apply(&self, proposal: &ChangeProposal, subject: &Subject) -> Result<ApplyResult> {
        let root = self.root.clone();
        let backup_dir = self.backups_dir.join(proposal.id());
        let proposal = proposal.clone();
        tokio::task::spawn_blocking(move || apply_all(&root, &backup_dir, &proposal))
            .await
            .context("join apply task")
    }
}

fn apply_all(root: &Path, backup_dir: &Path, proposal: &ChangeProposal) -> ApplyResult {
    let targets = proposal
        .targets()
        .iter()
        .map(|(target, change)| match apply_target(root, backup_dir, target, change) {
            Ok((message, backup)) => {
                debug!(target = %target, %message, "target applied");
                TargetApplyResult {
                    target: target.clone(),
                    success: true,
                    message,
                    backup,
                }
            }
            Err(err) => {
                warn!(target = %target, err = %format!("{err:#}"), "failed to apply target");
                TargetApplyResult {
                    target: target.clone(),
                    success: false,
                    message: format!("{err:#}"),
                    backup: None,
                }
            }
        })
        .collect();
    ApplyResult {
        proposal_id: proposal.id().to_string(),
        targets,
    }
}

/// Back up then write one target. Returns a message and the backup path.
fn apply_target(
    root: &Path,
    backup_dir: &Path,
    target: &str,
    change: &TargetChange,
) -> Result<(String, Option<PathBuf>)> {
    let path = resolve_target(root, target)
        .with_context(|| format!("refusing to write outside the repository: {target}"))?;
    let live = read_live(&path)?;

    if live.as_deref() == Some(change.new.as_bytes())
        && (!change.executable || is_executable(&path))
    {
        return Ok(("already up to date".to_string(), existing_backup(backup_dir, target)));
    }
    if live.as_deref().unwrap_or_default() != change.current.as_bytes() {
        bail!("{target} changed since the proposal was made; not overwriting it");
    }

    let backup = backup_once(&path, backup_dir, target)?;
    let previous_mode = fs::metadata(&path).ok().map(|m| m.permissions());
    write_atomic(&path, change.new.as_bytes())?;
    if change.executable {
        make_executable(&path)?;
    } else if let Some(permissions) = previous_mode {
        fs::set_permissions(&path, permissions)
            .with_context(|| format!("restore permissions {}", path.display()))?;
    }
    Ok((format!("wrote {} bytes", change.new.len()), Some(backup)))
}

fn read_live(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

fn backup_paths(backup_dir: &Path, target: &str) -> (PathBuf, PathBuf) {
    let backup = backup_dir.join(target);
    let mut marker_name = backup.as_os_str().to_os_string();
    marker_name.push(ABSENT_SUFFIX);
    (backup, PathBuf::from(marker_name))
}

fn existing_backup(backup_dir: &Path, target: &str) -> Option<PathBuf> {
    let (backup, marker) = backup_paths(backup_dir, target);
    [backup, marker].into_iter().find(|p| p.exists())
}

/// Copy the pre-apply content of `path` into the proposal's backup directory,
/// unless a backup (or an absent marker) already exists.
fn backup_once(path: &Path, backup_dir: &Path, target: &str) -> Result<PathBuf> {
    if let Some(existing) = existing_backup(backup_dir, target) {
        return Ok(existing);
    }
    let (backup, marker) = backup_paths(backup_dir, target);
    if path.exists() {
        let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        write_atomic(&backup, &contents)?;
        Ok(backup)
    } else {
        write_atomic(&marker, b"")?;
        Ok(marker)
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).is_ok_and(|m| m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("chmod {}", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
