//! File-backed signal inbox (`workflows/<id>/signals/`).
//!
//! Signals are posted by other processes (the CLI `signal` command, the server)
//! as `<seq>-<approve|reject>.json` files and consumed in sequence order by the
//! workflow process. Cancellation is a bare marker file.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use crate::io::atomic::write_atomic;
use crate::workflow::substrate::ApprovalSignal;

const MAX_POST_ATTEMPTS: u32 = 64;

/// Queue `signal` behind every signal already in `signals_dir`.
pub fn post_signal(signals_dir: &Path, signal: &ApprovalSignal) -> Result<PathBuf> {
    fs::create_dir_all(signals_dir)
        .with_context(|| format!("create directory {}", signals_dir.display()))?;
    let mut buf = serde_json::to_string_pretty(signal).context("serialize signal")?;
    buf.push('\n');
    let kind = if signal.approved { "approve" } else { "reject" };

    for _ in 0..MAX_POST_ATTEMPTS {
        let seq = pending_entries(signals_dir)?
            .last()
            .map_or(1, |(seq, _)| seq + 1);
        let path = signals_dir.join(format!("{seq:08}-{kind}.json"));
        let tmp = signals_dir.join(format!(".{seq:08}-{kind}.json.tmp"));
        fs::write(&tmp, &buf).with_context(|| format!("write {}", tmp.display()))?;
        // hard_link fails if the name is taken, so concurrent posters never overwrite each other.
        let linked = fs::hard_link(&tmp, &path);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {
                debug!(path = %path.display(), approved = signal.approved, "signal posted");
                return Ok(path);
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("publish signal {}", path.display()));
            }
        }
    }
    Err(anyhow!(
        "could not post signal to {} after {MAX_POST_ATTEMPTS} attempts",
        signals_dir.display()
    ))
}

/// Remove and return the oldest pending signal.
///
/// Unparseable signal files are logged and dropped.
pub fn take_next_signal(signals_dir: &Path) -> Result<Option<ApprovalSignal>> {
    for (_, path) in pending_entries(signals_dir)? {
        let parsed = fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))
            .and_then(|contents| {
                serde_json::from_str::<ApprovalSignal>(&contents)
                    .with_context(|| format!("parse {}", path.display()))
            });
        remove_if_present(&path)?;
        match parsed {
            Ok(signal) => {
                debug!(path = %path.display(), approved = signal.approved, "signal consumed");
                return Ok(Some(signal));
            }
            Err(err) => warn!(err = %format!("{err:#}"), "dropping malformed signal"),
        }
    }
    Ok(None)
}

/// Remove every pending signal. Returns how many were removed.
pub fn discard_pending(signals_dir: &Path) -> Result<usize> {
    let entries = pending_entries(signals_dir)?;
    for (_, path) in &entries {
        remove_if_present(path)?;
    }
    Ok(entries.len())
}

pub fn request_cancel(cancel_path: &Path) -> Result<()> {
    write_atomic(cancel_path, b"cancel\n")
}

pub fn cancel_requested(cancel_path: &Path) -> bool {
    cancel_path.is_file()
}

pub fn clear_cancel(cancel_path: &Path) -> Result<()> {
    remove_if_present(cancel_path)
}

fn pending_entries(signals_dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let entries = match fs::read_dir(signals_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("read {}", signals_dir.display()));
        }
    };
    let mut pending = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", signals_dir.display()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(seq) = parse_signal_name(name) {
            pending.push((seq, entry.path()));
        }
    }
    pending.sort();
    Ok(pending)
}

fn parse_signal_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".json")?;
    let (seq, kind) = stem.split_once('-')?;
    if kind != "approve" && kind != "reject" {
        return None;
    }
    seq.parse().ok()
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}
