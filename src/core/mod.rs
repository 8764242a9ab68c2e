//! Core orchestration logic.
//!
//! This module contains:
//! - BuildConfig: Build config definitions and loading
//! - ProcessRunner: Stage process spawning and tree termination
//! - StageExecutor: Single stage execution with output batching
//! - SudoRelay: Credential hand-off for privileged stages
//! - Orchestrator: Build lifecycle engine

pub mod build_config;
pub mod executor;
pub mod orchestrator;
pub mod process;
pub mod retry;
pub mod sudo;

// Re-export commonly used types
pub use build_config::{hash_content, BuildConfig, ConfigDocument, ConfigError, StageGraph, StageId, StageSpec};
pub use executor::{BuildControl, StageContext, StageExecutor};
pub use orchestrator::{BuildHealth, ForceCancelOutcome, Orchestrator, OrchestratorError};
pub use process::{
    ExitStatus, OutputLine, OutputStream, ProcessError, ProcessHandle, ProcessRunner, ProcessSpec,
    TerminatedProcess,
};
pub use retry::{with_retry, RetryPolicy};
pub use sudo::{Credential, RelayState, SudoRelay};
