//! Contract between the workflow logic and the runtime it executes on.
//!
//! Orchestration code never reads the host clock, never sleeps on its own and
//! never touches storage directly: every time read, timer, signal and
//! persistence call goes through a [`Substrate`].

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::outcome::CycleReport;
use crate::core::state::WorkflowState;

/// How a substrate sleep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Elapsed,
    Cancelled,
}

/// Out-of-band approve/reject signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalSignal {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ApprovalSignal {
    pub fn approve() -> Self {
        Self {
            approved: true,
            note: None,
        }
    }

    pub fn reject() -> Self {
        Self {
            approved: false,
            note: None,
        }
    }
}

#[async_trait]
pub trait Substrate: Send + Sync {
    /// Replay-safe current time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend for `duration`, returning early if cancellation is requested.
    async fn sleep(&self, duration: Duration) -> Wake;

    /// Pop the oldest pending approval signal, if any.
    async fn take_signal(&self) -> Result<Option<ApprovalSignal>>;

    /// Drop every pending signal. Returns how many were dropped.
    async fn discard_signals(&self) -> Result<usize>;

    async fn cancellation_requested(&self) -> Result<bool>;

    /// Last checkpointed state, if this workflow ran before.
    async fn load(&self) -> Result<Option<WorkflowState>>;

    /// Durably persist `state`. Called after every stage transition.
    async fn checkpoint(&self, state: &WorkflowState) -> Result<()>;

    /// Durably record a finished cycle.
    async fn record_cycle(&self, report: &CycleReport) -> Result<()>;
}
