//! Trigger specification: how and when a cycle starts.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Evolution cadence for the periodic variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cadence {
    /// Triggered externally (one cycle per invocation).
    PerCommit,
    Daily,
    #[default]
    Weekly,
    Monthly,
}

impl Cadence {
    /// Fixed period between cycles; `None` for externally triggered cadences.
    pub fn period(self) -> Option<Duration> {
        match self {
            Cadence::PerCommit => None,
            Cadence::Daily => Some(DAY),
            Cadence::Weekly => Some(DAY * 7),
            Cadence::Monthly => Some(DAY * 30),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Cadence::PerCommit => "per-commit",
            Cadence::Daily => "daily",
            Cadence::Weekly => "weekly",
            Cadence::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per-commit" | "on-commit" | "onCommit" => Ok(Cadence::PerCommit),
            "daily" => Ok(Cadence::Daily),
            "weekly" => Ok(Cadence::Weekly),
            "monthly" => Ok(Cadence::Monthly),
            other => Err(format!(
                "unknown cadence '{other}' (expected per-commit, daily, weekly or monthly)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum TriggerMode {
    /// Run exactly one cycle, then finish.
    OnDemand,
    /// Repeat cycles every `period` until cancelled.
    Interval {
        #[serde(with = "duration_secs")]
        period: Duration,
    },
}

impl TriggerMode {
    pub fn from_cadence(cadence: Cadence) -> Self {
        match cadence.period() {
            Some(period) => TriggerMode::Interval { period },
            None => TriggerMode::OnDemand,
        }
    }
}

/// Immutable description of how a workflow is triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub mode: TriggerMode,
    pub auto_approve: bool,
    #[serde(with = "duration_secs")]
    pub approval_timeout: Duration,
    #[serde(default)]
    pub hint: Option<String>,
}

impl TriggerSpec {
    pub fn on_demand() -> Self {
        Self {
            mode: TriggerMode::OnDemand,
            auto_approve: false,
            approval_timeout: DEFAULT_APPROVAL_TIMEOUT,
            hint: None,
        }
    }

    pub fn interval(period: Duration) -> Self {
        Self {
            mode: TriggerMode::Interval { period },
            ..Self::on_demand()
        }
    }

    pub fn from_cadence(cadence: Cadence) -> Self {
        Self {
            mode: TriggerMode::from_cadence(cadence),
            ..Self::on_demand()
        }
    }

    pub fn with_auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve = auto_approve;
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout;
        self
    }

    pub fn with_hint(mut self, hint: Option<String>) -> Self {
        self.hint = hint.filter(|h| !h.trim().is_empty());
        self
    }

    pub fn is_on_demand(&self) -> bool {
        matches!(self.mode, TriggerMode::OnDemand)
    }

    /// Delay before the next cycle after a successful one.
    pub fn next_cycle_delay(&self) -> Option<Duration> {
        match self.mode {
            TriggerMode::OnDemand => None,
            TriggerMode::Interval { period } => Some(period),
        }
    }

    /// Delay before retrying after an unhandled cycle error: the lesser of the
    /// cadence and one hour.
    pub fn error_backoff(&self) -> Option<Duration> {
        self.next_cycle_delay()
            .map(|period| period.min(MAX_ERROR_BACKOFF))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.approval_timeout.is_zero() {
            anyhow::bail!("approval timeout must be > 0");
        }
        if let TriggerMode::Interval { period } = self.mode
            && period.is_zero()
        {
            anyhow::bail!("interval period must be > 0");
        }
        Ok(())
    }
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
