//! Stage records and execution results.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::build::UnknownStatus;

/// One stage of a build, as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name (unique within a build)
    pub name: String,

    /// Declared `order` from the config
    pub stage_order: i64,

    /// Current status
    pub status: StageStatus,

    pub start_time: Option<DateTime<Utc>>,

    pub end_time: Option<DateTime<Utc>>,

    /// Accumulated stdout
    pub output_log: String,

    /// Accumulated stderr
    pub error_log: String,
}

impl Stage {
    /// Create a pending stage
    pub fn new(name: String, stage_order: i64) -> Self {
        Self {
            name,
            stage_order,
            status: StageStatus::Pending,
            start_time: None,
            end_time: None,
            output_log: String::new(),
            error_log: String::new(),
        }
    }

    /// Mark the stage as running
    pub fn start(&mut self, at: DateTime<Utc>) {
        self.status = StageStatus::Running;
        self.start_time = Some(at);
    }

    /// Move to a terminal status
    pub fn finish(&mut self, status: StageStatus, at: DateTime<Utc>) {
        self.status = status;
        self.end_time = Some(at);
    }

    /// Elapsed time between start and end, if both are known
    pub fn duration(&self) -> Option<Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }
}

/// Status of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    /// Never executed because an earlier required stage failed or the build was cancelled
    Skipped,
    Cancelled,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl Default for StageStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Why a stage did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageFailure {
    #[error("command exited with code {0}")]
    ExitCode(i32),

    #[error("command terminated by signal {0}")]
    Signal(i32),

    #[error("privilege escalation was declined")]
    PrivilegeDeclined,

    #[error("failed to launch command: {0}")]
    Spawn(String),

    #[error("lost track of the process: {0}")]
    Lost(String),

    #[error("stage was cancelled")]
    Cancelled,
}

impl StageFailure {
    /// Whether the stage's rollback command should run for this failure
    pub fn wants_rollback(&self) -> bool {
        matches!(
            self,
            Self::ExitCode(_) | Self::Signal(_) | Self::PrivilegeDeclined | Self::Lost(_)
        )
    }
}

/// Outcome of executing one stage
#[derive(Debug, Clone)]
pub struct StageResult {
    pub stage: String,
    pub status: StageStatus,
    pub exit_code: Option<i32>,
    pub failure: Option<StageFailure>,
    pub duration: Duration,
}

impl StageResult {
    pub fn is_success(&self) -> bool {
        self.status == StageStatus::Success
    }
}
