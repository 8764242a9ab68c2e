//! Build records.
//!
//! A Build is one invocation of a build config. It is owned by the
//! orchestrator while it runs and immutable once terminal, except for the
//! `archived` transition.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::stage::Stage;

/// A single build run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    /// Unique identifier (`lfs-YYYYMMDD-HHMMSS-xxxxxxxx`)
    pub build_id: String,

    /// Name of the config this build executes
    pub config_name: String,

    /// Lifecycle status
    pub status: BuildStatus,

    /// When the build was created
    pub start_time: DateTime<Utc>,

    /// When the build reached a terminal status
    pub end_time: Option<DateTime<Utc>>,

    /// Wall-clock duration, fixed once terminal
    pub duration_seconds: i64,

    /// Number of stages in the config
    pub total_stages: u32,

    /// Number of stages that finished with `success`
    pub completed_stages: u32,
}

impl Build {
    /// Create a new pending build
    pub fn new(build_id: String, config_name: String, total_stages: u32) -> Self {
        Self {
            build_id,
            config_name,
            status: BuildStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            duration_seconds: 0,
            total_stages,
            completed_stages: 0,
        }
    }

    /// Move to a terminal status, fixing end time and duration
    pub fn finish(&mut self, status: BuildStatus, at: DateTime<Utc>) {
        self.status = status;
        self.end_time = Some(at);
        self.duration_seconds = (at - self.start_time).num_seconds().max(0);
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Generate a build id in the form `lfs-20240101-120000-1a2b3c4d`
pub fn generate_build_id() -> String {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("lfs-{}-{}", stamp, &suffix[..8])
}

/// Status of a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    /// Hidden from default listings; only reachable from a terminal status
    Archived,
}

impl BuildStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Archived => "archived",
        }
    }

    /// Whether the build has stopped executing
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl Default for BuildStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "archived" => Ok(Self::Archived),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A status string read from storage that no enum variant matches
#[derive(Debug, Clone, Error)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

/// A build together with its stages, ordered by `stage_order`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    pub build: Build,
    pub stages: Vec<Stage>,
}

/// A control request queued for a running build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Cancel,
    ForceCancel,
}

impl ControlAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cancel => "cancel",
            Self::ForceCancel => "force_cancel",
        }
    }
}

impl FromStr for ControlAction {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cancel" => Ok(Self::Cancel),
            "force_cancel" => Ok(Self::ForceCancel),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}
