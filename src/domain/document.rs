//! Append-only log documents attached to builds.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::build::UnknownStatus;

/// A write-once document tied to a build and optionally a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogDocument {
    /// Storage-assigned id (0 until persisted)
    pub id: i64,

    pub build_id: String,

    /// Stage the document belongs to, if any
    pub stage: Option<String>,

    pub document_type: DocumentType,

    pub title: String,

    pub content: String,

    /// Free-form metadata
    pub metadata: serde_json::Value,

    pub created_at: DateTime<Utc>,
}

impl LogDocument {
    /// Create a build-level document
    pub fn new(
        build_id: impl Into<String>,
        document_type: DocumentType,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            build_id: build_id.into(),
            stage: None,
            document_type,
            title: title.into(),
            content: content.into(),
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    /// Attach the document to a stage
    pub fn for_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Kind of log document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Log,
    Config,
    Error,
    Output,
    Summary,
}

impl DocumentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Config => "config",
            Self::Error => "error",
            Self::Output => "output",
            Self::Summary => "summary",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "log" => Ok(Self::Log),
            "config" => Ok(Self::Config),
            "error" => Ok(Self::Error),
            "output" => Ok(Self::Output),
            "summary" => Ok(Self::Summary),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}
