//! Persistence gateway for builds, stages, and log documents.
//!
//! Terminal transitions are conditional: an update that would overwrite a
//! terminal status is ignored and reported as `false`, so concurrent
//! cancel paths cannot flip a finished record.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{Build, BuildStatus, ControlAction, LogDocument, Stage, UnknownStatus};

pub use memory::MemoryGateway;
pub use sqlite::SqliteGateway;

/// Errors from the storage layer
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Build {0} not found")]
    NotFound(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<UnknownStatus> for PersistenceError {
    fn from(e: UnknownStatus) -> Self {
        Self::Corrupt(e.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        Self::Corrupt(e.to_string())
    }
}

/// A queued control request
#[derive(Debug, Clone, PartialEq)]
pub struct ControlRequest {
    pub id: i64,
    pub build_id: String,
    pub action: ControlAction,
    pub requested_at: DateTime<Utc>,
}

/// Storage used by the orchestrator and the CLI
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Insert a new build row
    async fn create_build(&self, build: &Build) -> Result<(), PersistenceError>;

    /// Overwrite a build row unless the stored status is already terminal.
    /// Returns whether the row changed.
    async fn update_build(&self, build: &Build) -> Result<bool, PersistenceError>;

    /// Move a terminal build to `archived`. Returns whether the row changed.
    async fn archive_build(&self, build_id: &str) -> Result<bool, PersistenceError>;

    /// Insert the pending stage rows of a build
    async fn insert_stages(&self, build_id: &str, stages: &[Stage]) -> Result<(), PersistenceError>;

    /// Overwrite a stage row unless the stored status is already terminal.
    /// Returns whether the row changed.
    async fn update_stage(&self, build_id: &str, stage: &Stage) -> Result<bool, PersistenceError>;

    /// In one step: mark a non-terminal build `cancelled`, its running stages
    /// `cancelled` and its pending stages `skipped`. Returns whether the
    /// build row changed.
    async fn cancel_build_rows(
        &self,
        build_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError>;

    /// Append a document and return its id
    async fn append_document(&self, document: &LogDocument) -> Result<i64, PersistenceError>;

    async fn get_build(&self, build_id: &str) -> Result<Option<Build>, PersistenceError>;

    /// Stages of a build ordered by `stage_order`
    async fn list_stages(&self, build_id: &str) -> Result<Vec<Stage>, PersistenceError>;

    /// Documents of a build in append order, optionally for one stage
    async fn list_documents(
        &self,
        build_id: &str,
        stage: Option<&str>,
    ) -> Result<Vec<LogDocument>, PersistenceError>;

    /// Most recent builds first, archived ones excluded unless asked for
    async fn list_builds(
        &self,
        limit: usize,
        include_archived: bool,
    ) -> Result<Vec<Build>, PersistenceError>;

    /// Timestamp of the newest write belonging to a build
    async fn last_activity(&self, build_id: &str)
        -> Result<Option<DateTime<Utc>>, PersistenceError>;

    /// Queue a control request for whichever process runs the build
    async fn request_control(
        &self,
        build_id: &str,
        action: ControlAction,
    ) -> Result<i64, PersistenceError>;

    /// Claim unhandled control requests for a build
    async fn take_controls(&self, build_id: &str) -> Result<Vec<ControlRequest>, PersistenceError>;
}

/// Whether a stored build status may still change to `next`
pub(crate) fn build_transition_allowed(current: BuildStatus, next: BuildStatus) -> bool {
    match next {
        BuildStatus::Archived => current.is_terminal() && current != BuildStatus::Archived,
        _ => !current.is_terminal(),
    }
}
