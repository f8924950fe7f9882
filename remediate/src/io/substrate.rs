//! Single-process substrate backed by the tokio timer and `.remediate/` files.
//!
//! The clock is anchored once at construction and advanced by the monotonic
//! tokio clock, so orchestration never reads the host wall clock after start and
//! a paused tokio runtime drives it deterministically in tests.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::core::outcome::CycleReport;
use crate::core::state::WorkflowState;
use crate::io::paths::WorkflowPaths;
use crate::io::{inbox, journal, store};
use crate::workflow::substrate::{ApprovalSignal, Substrate, Wake};

const DEFAULT_INBOX_POLL: Duration = Duration::from_millis(500);

/// Sends approval signals to a running [`LocalSubstrate`] from the same process.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<ApprovalSignal>,
}

impl SignalSender {
    /// Deliver `signal`. Returns false if the substrate is gone.
    pub fn send(&self, signal: ApprovalSignal) -> bool {
        self.tx.send(signal).is_ok()
    }
}

/// Requests cancellation of a running [`LocalSubstrate`].
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Default)]
struct Memory {
    state: Option<WorkflowState>,
    checkpoints: usize,
    reports: Vec<CycleReport>,
}

pub struct LocalSubstrate {
    anchor_wall: DateTime<Utc>,
    anchor: Instant,
    signal_tx: mpsc::UnboundedSender<ApprovalSignal>,
    signal_rx: Mutex<mpsc::UnboundedReceiver<ApprovalSignal>>,
    cancel_tx: Arc<watch::Sender<bool>>,
    files: Option<WorkflowPaths>,
    inbox_poll: Duration,
    memory: Mutex<Memory>,
}

impl LocalSubstrate {
    /// Substrate that keeps state and journal in memory only.
    pub fn in_memory() -> Self {
        Self::build(None, Utc::now())
    }

    /// Substrate persisting to `paths` and reading its file inbox.
    pub fn with_files(paths: WorkflowPaths) -> Self {
        Self::build(Some(paths), Utc::now())
    }

    /// Override the wall-clock reading the clock is anchored to.
    pub fn anchored_at(mut self, at: DateTime<Utc>) -> Self {
        self.anchor_wall = at;
        self.anchor = Instant::now();
        self
    }

    /// How often a sleeping workflow checks the file inbox and cancel marker.
    pub fn inbox_poll(mut self, every: Duration) -> Self {
        self.inbox_poll = every.max(Duration::from_millis(1));
        self
    }

    fn build(files: Option<WorkflowPaths>, anchor_wall: DateTime<Utc>) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (cancel_tx, _) = watch::channel(false);
        Self {
            anchor_wall,
            anchor: Instant::now(),
            signal_tx,
            signal_rx: Mutex::new(signal_rx),
            cancel_tx: Arc::new(cancel_tx),
            files,
            inbox_poll: DEFAULT_INBOX_POLL,
            memory: Mutex::new(Memory::default()),
        }
    }

    pub fn signal_sender(&self) -> SignalSender {
        SignalSender {
            tx: self.signal_tx.clone(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel_tx),
        }
    }

    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    /// Number of checkpoints taken by this instance.
    pub fn checkpoint_count(&self) -> usize {
        self.memory().checkpoints
    }

    /// Cycle reports recorded by this instance.
    pub fn reports(&self) -> Vec<CycleReport> {
        self.memory().reports.clone()
    }

    fn memory(&self) -> MutexGuard<'_, Memory> {
        // A poisoned lock only means a panicking test thread; the data is still usable.
        self.memory
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn file_cancel_requested(&self) -> bool {
        self.files
            .as_ref()
            .is_some_and(|paths| inbox::cancel_requested(&paths.cancel_path))
    }
}

#[async_trait]
impl Substrate for LocalSubstrate {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.anchor);
        let elapsed = chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::MAX);
        self.anchor_wall
            .checked_add_signed(elapsed)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    async fn sleep(&self, duration: Duration) -> Wake {
        let deadline = Instant::now() + duration;
        let mut cancel_rx = self.cancel_tx.subscribe();
        loop {
            if *cancel_rx.borrow_and_update() || self.file_cancel_requested() {
                debug!("sleep interrupted by cancellation");
                return Wake::Cancelled;
            }
            let now = Instant::now();
            if now >= deadline {
                return Wake::Elapsed;
            }
            let mut step = deadline - now;
            if self.files.is_some() {
                step = step.min(self.inbox_poll);
            }
            tokio::select! {
                () = tokio::time::sleep(step) => {}
                changed = cancel_rx.changed() => {
                    if changed.is_err() {
                        tokio::time::sleep(step).await;
                    }
                }
            }
        }
    }

    async fn take_signal(&self) -> Result<Option<ApprovalSignal>> {
        let in_process = self
            .signal_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .try_recv()
            .ok();
        if in_process.is_some() {
            return Ok(in_process);
        }
        match &self.files {
            Some(paths) => inbox::take_next_signal(&paths.signals_dir),
            None => Ok(None),
        }
    }

    async fn discard_signals(&self) -> Result<usize> {
        let mut dropped = 0;
        {
            let mut rx = self
                .signal_rx
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            while rx.try_recv().is_ok() {
                dropped += 1;
            }
        }
        if let Some(paths) = &self.files {
            dropped += inbox::discard_pending(&paths.signals_dir)?;
        }
        Ok(dropped)
    }

    async fn cancellation_requested(&self) -> Result<bool> {
        Ok(*self.cancel_tx.borrow() || self.file_cancel_requested())
    }

    async fn load(&self) -> Result<Option<WorkflowState>> {
        match &self.files {
            Some(paths) => store::load_workflow_state(&paths.state_path),
            None => Ok(self.memory().state.clone()),
        }
    }

    async fn checkpoint(&self, state: &WorkflowState) -> Result<()> {
        if let Some(paths) = &self.files {
            store::write_workflow_state(&paths.state_path, state)?;
        }
        let mut memory = self.memory();
        memory.state = Some(state.clone());
        memory.checkpoints += 1;
        Ok(())
    }

    async fn record_cycle(&self, report: &CycleReport) -> Result<()> {
        if let Some(paths) = &self.files {
            journal::write_cycle(&paths.cycles_dir, report)?;
        }
        self.memory().reports.push(report.clone());
        Ok(())
    }
}
