//! Lifecycle events published to event sinks.
//!
//! Events are fire-and-forget notifications. Consumers must tolerate
//! duplicates.

use serde::{Deserialize, Serialize};

use super::build::BuildStatus;
use super::stage::StageStatus;

/// A build lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BuildEvent {
    /// A stage process is about to launch
    StageStart { build_id: String, stage: String },

    /// One line of live output from the running stage
    StageOutput {
        build_id: String,
        stage: String,
        line: String,
    },

    /// A stage reached a terminal status
    StageComplete {
        build_id: String,
        stage: String,
        status: StageStatus,
    },

    /// The build finished without a hard failure (success or cancelled)
    BuildComplete { build_id: String, status: BuildStatus },

    /// The build failed
    BuildError {
        build_id: String,
        stage: Option<String>,
        error: String,
    },

    /// A stage is blocked waiting for a sudo credential
    SudoRequired { build_id: String, reason: String },
}

impl BuildEvent {
    /// The build this event belongs to
    pub fn build_id(&self) -> &str {
        match self {
            Self::StageStart { build_id, .. }
            | Self::StageOutput { build_id, .. }
            | Self::StageComplete { build_id, .. }
            | Self::BuildComplete { build_id, .. }
            | Self::BuildError { build_id, .. }
            | Self::SudoRequired { build_id, .. } => build_id,
        }
    }

    /// Whether this event ends the build's event stream
    pub fn is_final(&self) -> bool {
        matches!(self, Self::BuildComplete { .. } | Self::BuildError { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = BuildEvent::StageComplete {
            build_id: "b1".to_string(),
            stage: "prepare_host".to_string(),
            status: StageStatus::Success,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"stage_complete\""));

        let parsed: BuildEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.build_id(), "b1");
        assert!(!parsed.is_final());
    }

    #[test]
    fn test_final_events() {
        let done = BuildEvent::BuildComplete {
            build_id: "b1".to_string(),
            status: BuildStatus::Success,
        };
        let failed = BuildEvent::BuildError {
            build_id: "b1".to_string(),
            stage: Some("build_toolchain".to_string()),
            error: "exit 1".to_string(),
        };

        assert!(done.is_final());
        assert!(failed.is_final());
    }
}
