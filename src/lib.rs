//! lfsbuild - Linux From Scratch build orchestrator
//!
//! Runs shell-scripted build stages in dependency order, records status,
//! durations, and logs in SQLite, and supports graceful and forced
//! cancellation plus interactive sudo prompts mid-build.
//!
//! # Architecture
//!
//! - A build config (YAML) is validated once into a stage graph
//! - The orchestrator runs one build per task, stage by stage
//! - Every state transition is written through a persistence gateway
//! - Lifecycle events go to an event sink; consumers answer sudo prompts
//!
//! # Modules
//!
//! - `adapters`: Event sinks
//! - `core`: Config loader, process runner, executor, sudo relay, orchestrator
//! - `domain`: Data structures (Build, Stage, LogDocument, BuildEvent)
//! - `store`: Persistence gateway (SQLite, in-memory)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Write and check a config
//! lfsbuild init-config lfs.yaml
//! lfsbuild validate lfs.yaml
//!
//! # Run it
//! lfsbuild start lfs.yaml
//!
//! # From another terminal
//! lfsbuild status <build-id>
//! lfsbuild force-cancel <build-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod store;

// Re-export main types at crate root for convenience
pub use adapters::{ChannelSink, EventSink, TracingSink};
pub use core::{BuildConfig, ConfigError, Credential, Orchestrator, OrchestratorError};
pub use domain::{Build, BuildEvent, BuildReport, BuildStatus, LogDocument, Stage, StageStatus};
pub use store::{MemoryGateway, PersistenceGateway, SqliteGateway};
