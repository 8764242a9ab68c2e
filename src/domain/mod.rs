//! Domain types for the build orchestrator.
//!
//! This module contains the core data structures:
//! - Build: One execution of a build config
//! - Stage: Per-stage status and logs
//! - LogDocument: Append-only build documents
//! - BuildEvent: Lifecycle notifications

pub mod build;
pub mod document;
pub mod events;
pub mod stage;

// Re-export commonly used types
pub use build::{generate_build_id, Build, BuildReport, BuildStatus, ControlAction, UnknownStatus};
pub use document::{DocumentType, LogDocument};
pub use events::BuildEvent;
pub use stage::{Stage, StageFailure, StageResult, StageStatus};
