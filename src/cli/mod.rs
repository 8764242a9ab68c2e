//! Command-line interface for lfsbuild.
//!
//! Provides commands for starting builds, cancelling them (also from a
//! second terminal), inspecting status and logs, and managing build
//! configs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::adapters::{ChannelSink, EventSink, FanoutSink, TracingSink};
use crate::config::config;
use crate::core::{BuildConfig, Credential, Orchestrator};
use crate::domain::{BuildEvent, BuildReport, BuildStatus};
use crate::store::{PersistenceGateway, SqliteGateway};

/// lfsbuild - Linux From Scratch build orchestrator
#[derive(Parser, Debug)]
#[command(name = "lfsbuild")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a build in the foreground
    Start {
        /// Build config (YAML)
        config: PathBuf,

        /// Log lifecycle events instead of printing stage output
        #[arg(short, long)]
        quiet: bool,

        /// Decline sudo prompts instead of asking for a password
        #[arg(long)]
        no_sudo: bool,
    },

    /// Cancel a running build gracefully
    Cancel {
        /// Build ID
        build_id: String,
    },

    /// Kill a build's processes and mark it cancelled immediately
    ForceCancel {
        /// Build ID
        build_id: String,
    },

    /// Show the status of a build
    Status {
        /// Build ID
        build_id: String,
    },

    /// List recent builds
    Builds {
        /// Maximum number of builds to show
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Include archived builds
        #[arg(short, long)]
        all: bool,
    },

    /// Print the log documents of a build
    Logs {
        /// Build ID
        build_id: String,

        /// Only documents of this stage
        #[arg(short, long)]
        stage: Option<String>,
    },

    /// Archive a finished build
    Archive {
        /// Build ID
        build_id: String,
    },

    /// Check whether a build is still making progress
    Health {
        /// Build ID
        build_id: String,

        /// Seconds without activity before a build counts as stale
        #[arg(long, default_value = "600")]
        stale_after: u64,
    },

    /// Write the stock LFS build config
    InitConfig {
        /// Destination file
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Check a build config and print its execution order
    Validate {
        /// Build config (YAML)
        config: PathBuf,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Start {
                config,
                quiet,
                no_sudo,
            } => start_build(&config, quiet, no_sudo).await,
            Commands::Cancel { build_id } => cancel_build(&build_id).await,
            Commands::ForceCancel { build_id } => force_cancel_build(&build_id).await,
            Commands::Status { build_id } => show_status(&build_id).await,
            Commands::Builds { limit, all } => list_builds(limit, all).await,
            Commands::Logs { build_id, stage } => show_logs(&build_id, stage.as_deref()).await,
            Commands::Archive { build_id } => archive_build(&build_id).await,
            Commands::Health {
                build_id,
                stale_after,
            } => check_health(&build_id, Duration::from_secs(stale_after)).await,
            Commands::InitConfig { path, force } => init_config(&path, force),
            Commands::Validate { config } => validate_config(&config),
            Commands::Config => show_config(),
        }
    }
}

/// Open the configured build database
fn open_gateway() -> Result<Arc<SqliteGateway>> {
    let path = &config()?.database;
    let gateway = SqliteGateway::open(path)
        .with_context(|| format!("Failed to open build database: {}", path.display()))?;
    Ok(Arc::new(gateway))
}

fn orchestrator(sink: Arc<dyn EventSink>) -> Result<Orchestrator> {
    let settings = config()?.execution.clone();
    Ok(Orchestrator::from_settings(open_gateway()?, sink, settings))
}

/// Run a build, streaming its events until it finishes
async fn start_build(path: &Path, quiet: bool, no_sudo: bool) -> Result<()> {
    let build_config = BuildConfig::load(path)
        .with_context(|| format!("Invalid build config: {}", path.display()))?;

    let (channel, mut events) = ChannelSink::new();
    let sink: Arc<dyn EventSink> = if quiet {
        Arc::new(
            FanoutSink::new()
                .with(Arc::new(channel))
                .with(Arc::new(TracingSink)),
        )
    } else {
        Arc::new(channel)
    };
    let orchestrator = orchestrator(sink)?;
    let build_id = orchestrator.start_build(build_config).await?;
    eprintln!("[Build {} started]", build_id);

    let wait = orchestrator.wait(&build_id);
    tokio::pin!(wait);
    let mut interrupts = 0;

    let report = loop {
        tokio::select! {
            report = &mut wait => {
                while let Ok(event) = events.try_recv() {
                    print_event(&event, quiet);
                }
                break report?;
            }
            Some(event) = events.recv() => {
                print_event(&event, quiet);
                if let BuildEvent::SudoRequired { build_id, reason } = event {
                    let credential = if no_sudo { None } else { prompt_password(&reason).await? };
                    orchestrator.supply_credential(&build_id, credential);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                interrupts += 1;
                if interrupts == 1 {
                    eprintln!("[Cancelling build {}; press Ctrl-C again to force]", build_id);
                    orchestrator.cancel_build(&build_id).await?;
                } else {
                    eprintln!("[Force cancelling build {}]", build_id);
                    orchestrator.force_cancel_build(&build_id).await?;
                }
            }
        }
    };

    print_report(&report);
    match report.build.status {
        BuildStatus::Failed => std::process::exit(1),
        BuildStatus::Cancelled => std::process::exit(130),
        _ => Ok(()),
    }
}

async fn prompt_password(reason: &str) -> Result<Option<Credential>> {
    let prompt = format!("{}\nsudo password (empty to decline): ", reason);
    let secret = tokio::task::spawn_blocking(move || rpassword::prompt_password(prompt))
        .await
        .context("Password prompt task failed")?
        .context("Failed to read password")?;

    Ok((!secret.is_empty()).then(|| Credential::new(secret)))
}

fn print_event(event: &BuildEvent, quiet: bool) {
    if quiet {
        return;
    }
    match event {
        BuildEvent::StageStart { stage, .. } => eprintln!("==> {}", stage),
        BuildEvent::StageOutput { line, .. } => println!("{}", line),
        BuildEvent::StageComplete { stage, status, .. } => {
            eprintln!("==> {}: {}", stage, status)
        }
        BuildEvent::BuildComplete { build_id, status } => {
            eprintln!("[Build {} {}]", build_id, status)
        }
        BuildEvent::BuildError {
            build_id,
            stage,
            error,
        } => match stage {
            Some(stage) => eprintln!("[Build {} failed at {}: {}]", build_id, stage, error),
            None => eprintln!("[Build {} failed: {}]", build_id, error),
        },
        BuildEvent::SudoRequired { .. } => {}
    }
}

fn print_report(report: &BuildReport) {
    let build = &report.build;
    println!("Build ID: {}", build.build_id);
    println!("Config: {}", build.config_name);
    println!("Status: {}", build.status);
    println!("Started: {}", build.start_time);
    if let Some(end) = build.end_time {
        println!("Finished: {} ({}s)", end, build.duration_seconds);
    }
    println!(
        "Progress: {}/{} stages",
        build.completed_stages, build.total_stages
    );
    println!("\nStages:");
    for stage in &report.stages {
        let elapsed = stage
            .duration()
            .map(|d| format!("{}s", d.as_secs()))
            .unwrap_or_default();
        println!("  {:<24} {:<10} {}", stage.name, stage.status, elapsed);
    }
}

/// Cancel a build, queueing the request if another process runs it
async fn cancel_build(build_id: &str) -> Result<()> {
    let orchestrator = orchestrator(Arc::new(TracingSink))?;
    if orchestrator.cancel_build(build_id).await? {
        println!("Cancel requested for {}", build_id);
    } else {
        println!("Build {} is not running", build_id);
    }
    Ok(())
}

/// Force cancel a build from outside its process
async fn force_cancel_build(build_id: &str) -> Result<()> {
    let orchestrator = orchestrator(Arc::new(TracingSink))?;
    let outcome = orchestrator.force_cancel_build(build_id).await?;

    if outcome.transitioned {
        println!("Build {} marked cancelled", build_id);
    } else {
        println!("Build {} was already finished", build_id);
    }
    for process in &outcome.terminated {
        let how = if process.forced { "killed" } else { "terminated" };
        println!("  {} {} ({})", how, process.pid, process.name);
    }
    Ok(())
}

/// Show the status of a build
async fn show_status(build_id: &str) -> Result<()> {
    let orchestrator = orchestrator(Arc::new(TracingSink))?;
    let report = orchestrator.status(build_id).await?;
    print_report(&report);
    Ok(())
}

/// List recent builds
async fn list_builds(limit: usize, all: bool) -> Result<()> {
    let gateway = open_gateway()?;
    let builds = gateway.list_builds(limit, all).await?;

    if builds.is_empty() {
        println!("No builds found");
        return Ok(());
    }

    println!(
        "{:<30} {:<24} {:<10} {:<8} {}",
        "BUILD ID", "CONFIG", "STATUS", "STAGES", "STARTED"
    );
    println!("{}", "-".repeat(100));

    for build in builds {
        println!(
            "{:<30} {:<24} {:<10} {:<8} {}",
            build.build_id,
            build.config_name,
            build.status,
            format!("{}/{}", build.completed_stages, build.total_stages),
            build.start_time.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// Print the documents of a build in order
async fn show_logs(build_id: &str, stage: Option<&str>) -> Result<()> {
    let gateway = open_gateway()?;
    if gateway.get_build(build_id).await?.is_none() {
        anyhow::bail!("Build {} not found", build_id);
    }

    let documents = gateway.list_documents(build_id, stage).await?;
    if documents.is_empty() {
        println!("No documents found");
        return Ok(());
    }

    for doc in documents {
        println!(
            "--- {} [{}] {}",
            doc.title,
            doc.document_type,
            doc.created_at.format("%H:%M:%S")
        );
        print!("{}", doc.content);
        if !doc.content.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

async fn archive_build(build_id: &str) -> Result<()> {
    let orchestrator = orchestrator(Arc::new(TracingSink))?;
    if orchestrator.archive_build(build_id).await? {
        println!("Archived {}", build_id);
    } else {
        anyhow::bail!("Build {} is not finished or already archived", build_id);
    }
    Ok(())
}

async fn check_health(build_id: &str, stale_after: Duration) -> Result<()> {
    let orchestrator = orchestrator(Arc::new(TracingSink))?;
    let health = orchestrator.health(build_id, stale_after).await?;

    println!("Status: {}", health.status);
    match health.last_activity {
        Some(at) => println!("Last activity: {}", at),
        None => println!("Last activity: never"),
    }

    if health.stale {
        println!("No recent activity for more than {}s", stale_after.as_secs());
        std::process::exit(1);
    }
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    BuildConfig::write_default(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote default LFS build config to {}", path.display());
    Ok(())
}

fn validate_config(path: &Path) -> Result<()> {
    let build_config = BuildConfig::load(path)
        .with_context(|| format!("Invalid build config: {}", path.display()))?;

    println!(
        "{} {} ({} stages, hash {})",
        build_config.name,
        build_config.version,
        build_config.stages.len(),
        build_config.config_hash()
    );
    let graph = build_config.graph();
    for (i, &id) in graph.order().iter().enumerate() {
        let stage = &build_config.stages[id.0];
        let after: Vec<&str> = graph
            .dependencies(id)
            .iter()
            .map(|dep| build_config.stages[dep.0].name.as_str())
            .collect();

        let mut notes = Vec::new();
        if !after.is_empty() {
            notes.push(format!("after {}", after.join(", ")));
        }
        if stage.allow_failure {
            notes.push("allow_failure".to_string());
        }
        if stage.rollback().is_some() {
            notes.push("rollback".to_string());
        }
        println!("  {:>2}. {:<24} {}", i + 1, stage.name, notes.join(", "));
    }
    Ok(())
}

fn show_config() -> Result<()> {
    let resolved = config()?;
    println!("Home: {}", resolved.home.display());
    println!("Database: {}", resolved.database.display());
    match &resolved.config_file {
        Some(path) => println!("Config file: {}", path.display()),
        None => println!("Config file: (none)"),
    }

    let exec = &resolved.execution;
    println!("LFS root: {}", exec.lfs_root.display());
    if let Some(dir) = &exec.default_working_dir {
        println!("Working dir: {}", dir.display());
    }
    println!("Grace period: {:?}", exec.grace_period);
    println!(
        "Output flush: {} lines / {:?}",
        exec.flush_lines, exec.flush_interval
    );
    println!("Control poll: {:?}", exec.control_poll_interval);
    println!("Sudo markers: {:?}", exec.prompt_markers());
    Ok(())
}
