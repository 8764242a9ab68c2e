//! Build orchestrator.
//!
//! Owns the lifecycle of every build started in this process: persists the
//! build, runs its stages in order on a dedicated task, aggregates the
//! terminal status, and handles cancel, force cancel, and sudo answers.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::build_config::{BuildConfig, StageSpec};
use super::executor::{BuildControl, StageContext, StageExecutor};
use super::process::{signal_group, ProcessError, ProcessRunner, TerminatedProcess};
use super::retry::with_retry;
use super::sudo::{Credential, SudoRelay};
use crate::adapters::EventSink;
use crate::config::ExecutionSettings;
use crate::domain::{
    generate_build_id, Build, BuildEvent, BuildReport, BuildStatus, ControlAction, DocumentType,
    LogDocument, Stage, StageStatus,
};
use crate::store::{PersistenceError, PersistenceGateway};

/// Lock file taken in a build's working directory
pub const WORKSPACE_LOCK: &str = ".lfsbuild.lock";

/// Errors surfaced by the orchestrator
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Build {0} not found")]
    UnknownBuild(String),

    #[error("Working directory {} is in use by {holder}", working_dir.display())]
    AlreadyRunning { working_dir: PathBuf, holder: String },

    #[error("Stage '{stage}' was reached before its dependency '{dependency}' finished")]
    InvalidOrder { stage: String, dependency: String },

    #[error("Persistence failed: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Build worker failed: {0}")]
    Worker(String),
}

/// Result of a force cancel
#[derive(Debug, Clone, Default)]
pub struct ForceCancelOutcome {
    /// Whether this call moved the build to `cancelled`
    pub transitioned: bool,
    /// Processes killed by the tree scan
    pub terminated: Vec<TerminatedProcess>,
}

/// Liveness of a build
#[derive(Debug, Clone)]
pub struct BuildHealth {
    pub status: BuildStatus,
    pub last_activity: Option<DateTime<Utc>>,
    /// Non-terminal and nothing written within the threshold
    pub stale: bool,
}

#[derive(Clone)]
struct ActiveBuild {
    control: Arc<BuildControl>,
    done: watch::Receiver<Option<BuildReport>>,
}

/// Runs builds and answers control requests for them
#[derive(Clone)]
pub struct Orchestrator {
    gateway: Arc<dyn PersistenceGateway>,
    executor: Arc<StageExecutor>,
    sink: Arc<dyn EventSink>,
    relay: Arc<SudoRelay>,
    settings: ExecutionSettings,
    active: Arc<Mutex<HashMap<String, ActiveBuild>>>,
}

impl Orchestrator {
    /// Create an orchestrator with an explicit process runner
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        runner: ProcessRunner,
        sink: Arc<dyn EventSink>,
        settings: ExecutionSettings,
    ) -> Self {
        let relay = Arc::new(SudoRelay::new(sink.clone(), settings.prompt_markers()));
        let executor = Arc::new(StageExecutor::new(
            gateway.clone(),
            runner,
            sink.clone(),
            relay.clone(),
            settings.clone(),
        ));
        debug!(sink = sink.name(), "Orchestrator ready");

        Self {
            gateway,
            executor,
            sink,
            relay,
            settings,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create an orchestrator whose runner follows the settings
    pub fn from_settings(
        gateway: Arc<dyn PersistenceGateway>,
        sink: Arc<dyn EventSink>,
        settings: ExecutionSettings,
    ) -> Self {
        let runner = ProcessRunner::new(settings.grace_period)
            .with_sudo_prompt(settings.sudo_prompt.clone())
            .with_kill_patterns(&settings.kill_patterns);
        Self::new(gateway, runner, sink, settings)
    }

    pub fn gateway(&self) -> &Arc<dyn PersistenceGateway> {
        &self.gateway
    }

    /// Persist a new build and start running it in the background
    #[instrument(skip(self, config), fields(config = %config.name))]
    pub async fn start_build(&self, config: BuildConfig) -> Result<String, OrchestratorError> {
        let build_id = generate_build_id();
        let working_dir = config
            .working_dir
            .clone()
            .or_else(|| self.settings.default_working_dir.clone());
        let workspace_lock = self.acquire_workspace(working_dir.as_deref())?;

        let order: Vec<StageSpec> = config.execution_order().into_iter().cloned().collect();
        let build = Build::new(build_id.clone(), config.name.clone(), order.len() as u32);
        let stages: Vec<Stage> = order
            .iter()
            .map(|s| Stage::new(s.name.clone(), s.order))
            .collect();

        let policy = &self.settings.status_retry;
        with_retry(policy, "build create", || self.gateway.create_build(&build)).await?;
        let inserted = with_retry(policy, "stage insert", || {
            self.gateway.insert_stages(&build_id, &stages)
        })
        .await;
        if let Err(e) = inserted {
            error!(build_id = %build_id, "Could not record stages: {}", e);
            let mut failed = build.clone();
            failed.finish(BuildStatus::Failed, Utc::now());
            if let Err(write) = self.gateway.update_build(&failed).await {
                error!(build_id = %build_id, "Could not mark build failed: {}", write);
            }
            return Err(e.into());
        }

        self.store_config_document(&build_id, &config, working_dir.as_deref())
            .await;

        let control = Arc::new(BuildControl::new(working_dir.clone()));
        let (done_tx, done_rx) = watch::channel(None);
        self.active.lock().insert(
            build_id.clone(),
            ActiveBuild {
                control: control.clone(),
                done: done_rx,
            },
        );

        self.relay.open(&build_id);

        info!(build_id = %build_id, stages = order.len(), "Build created");

        let this = self.clone();
        let id = build_id.clone();
        tokio::spawn(async move {
            let poller = tokio::spawn(this.clone().poll_controls(id.clone()));

            let run = tokio::spawn(this.clone().run_stages(
                build,
                stages,
                order,
                config.environment,
                working_dir,
                control,
            ));

            let report = match run.await {
                Ok(Ok(report)) => report,
                Ok(Err(e)) => this.fail_abnormally(&id, e.to_string()).await,
                Err(e) => {
                    this.fail_abnormally(&id, format!("worker panicked: {}", e))
                        .await
                }
            };

            poller.abort();
            this.relay.release(&id);
            drop(workspace_lock);
            this.active.lock().remove(&id);
            let _ = done_tx.send(Some(report));
        });

        Ok(build_id)
    }

    /// Start a build and wait for it to finish
    pub async fn run_build(&self, config: BuildConfig) -> Result<BuildReport, OrchestratorError> {
        let build_id = self.start_build(config).await?;
        self.wait(&build_id).await
    }

    /// Wait for a build to reach a terminal status
    pub async fn wait(&self, build_id: &str) -> Result<BuildReport, OrchestratorError> {
        let done = self.active.lock().get(build_id).map(|a| a.done.clone());

        if let Some(mut done) = done {
            let report = done
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|r| (*r).clone());
            if let Some(report) = report {
                return Ok(report);
            }
        }

        self.status(build_id).await
    }

    /// Current stored state of a build
    pub async fn status(&self, build_id: &str) -> Result<BuildReport, OrchestratorError> {
        let build = self
            .gateway
            .get_build(build_id)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownBuild(build_id.to_string()))?;
        let stages = self.gateway.list_stages(build_id).await?;
        Ok(BuildReport { build, stages })
    }

    /// Whether a build has a live worker in this process
    pub fn is_active(&self, build_id: &str) -> bool {
        self.active.lock().contains_key(build_id)
    }

    /// Request a graceful cancel. Returns `false` when there is nothing to do
    /// (already cancelling or already terminal).
    #[instrument(skip(self))]
    pub async fn cancel_build(&self, build_id: &str) -> Result<bool, OrchestratorError> {
        let control = self.active.lock().get(build_id).map(|a| a.control.clone());

        if let Some(control) = control {
            if control.is_cancelled() {
                debug!("Cancel already requested");
                return Ok(false);
            }
            info!("Cancelling build");
            control.cancel.cancel();
            return Ok(true);
        }

        // Not ours: hand it to whichever process runs it
        let build = self
            .gateway
            .get_build(build_id)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownBuild(build_id.to_string()))?;
        if build.is_terminal() {
            return Ok(false);
        }
        self.gateway
            .request_control(build_id, ControlAction::Cancel)
            .await?;
        info!("Queued cancel for build owned by another process");
        Ok(true)
    }

    /// Kill the build's process tree and mark it `cancelled` right away.
    ///
    /// Works on builds without a live worker here too: their stored rows
    /// are cancelled and the process table is scanned for leftovers.
    #[instrument(skip(self))]
    pub async fn force_cancel_build(
        &self,
        build_id: &str,
    ) -> Result<ForceCancelOutcome, OrchestratorError> {
        let control = self.active.lock().get(build_id).map(|a| a.control.clone());

        let (root, working_dir) = match &control {
            Some(control) => {
                control.cancel.cancel();
                control.force.cancel();
                let root = control.current_pid();
                if let Some(pid) = root {
                    if let Err(e) = signal_group(pid, libc::SIGKILL) {
                        warn!("{}", e);
                    }
                }
                (root, control.working_dir.clone())
            }
            None => {
                let build = self
                    .gateway
                    .get_build(build_id)
                    .await?
                    .ok_or_else(|| OrchestratorError::UnknownBuild(build_id.to_string()))?;
                if !build.is_terminal() {
                    self.gateway
                        .request_control(build_id, ControlAction::ForceCancel)
                        .await?;
                }
                (None, self.recorded_working_dir(build_id).await)
            }
        };

        let transitioned = with_retry(&self.settings.status_retry, "force cancel", || {
            self.gateway.cancel_build_rows(build_id, Utc::now())
        })
        .await?;

        if transitioned {
            warn!("Build force cancelled");
            self.sink.emit(BuildEvent::BuildComplete {
                build_id: build_id.to_string(),
                status: BuildStatus::Cancelled,
            });
        }

        let terminated = self
            .executor
            .runner()
            .terminate_tree(root, build_id, working_dir.as_deref())
            .await?;
        if !terminated.is_empty() {
            info!(count = terminated.len(), "Terminated build processes");
        }

        Ok(ForceCancelOutcome {
            transitioned,
            terminated,
        })
    }

    /// Answer a pending sudo request. `None` declines it.
    /// Builds without a live worker here are refused and nothing is kept.
    pub fn supply_credential(&self, build_id: &str, credential: Option<Credential>) -> bool {
        if !self.is_active(build_id) {
            debug!(build_id, "Credential supplied for a build that is not running here");
            return false;
        }
        self.relay.supply_credential(build_id, credential)
    }

    /// Move a terminal build to `archived`
    pub async fn archive_build(&self, build_id: &str) -> Result<bool, OrchestratorError> {
        if self.gateway.get_build(build_id).await?.is_none() {
            return Err(OrchestratorError::UnknownBuild(build_id.to_string()));
        }
        Ok(self.gateway.archive_build(build_id).await?)
    }

    /// Report whether a build is still making progress
    pub async fn health(
        &self,
        build_id: &str,
        stale_after: Duration,
    ) -> Result<BuildHealth, OrchestratorError> {
        let build = self
            .gateway
            .get_build(build_id)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownBuild(build_id.to_string()))?;
        let last_activity = self.gateway.last_activity(build_id).await?;

        let stale = !build.is_terminal()
            && match last_activity {
                Some(at) => (Utc::now() - at).to_std().unwrap_or_default() > stale_after,
                None => true,
            };

        Ok(BuildHealth {
            status: build.status,
            last_activity,
            stale,
        })
    }

    async fn run_stages(
        self,
        mut build: Build,
        mut stages: Vec<Stage>,
        order: Vec<StageSpec>,
        env: BTreeMap<String, String>,
        working_dir: Option<PathBuf>,
        control: Arc<BuildControl>,
    ) -> Result<BuildReport, OrchestratorError> {
        let build_id = build.build_id.clone();
        let ctx = StageContext {
            build_id: &build_id,
            working_dir: working_dir.as_deref(),
            env: &env,
            control: &control,
        };

        let mut failed_stage: Option<(String, String)> = None;
        let mut cancelled = false;

        for i in 0..order.len() {
            let spec = &order[i];
            cancelled |= control.is_cancelled();

            if cancelled || failed_stage.is_some() {
                self.skip_stage(&build_id, &mut stages[i]).await?;
                continue;
            }

            for dependency in &spec.dependencies {
                let finished = stages[..i]
                    .iter()
                    .any(|s| &s.name == dependency && s.status.is_terminal());
                if !finished {
                    return Err(OrchestratorError::InvalidOrder {
                        stage: spec.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }

            if build.status == BuildStatus::Pending {
                build.status = BuildStatus::Running;
                if !self.persist_build(&build).await? {
                    cancelled = true;
                    self.skip_stage(&build_id, &mut stages[i]).await?;
                    continue;
                }
                info!(build_id = %build_id, "Build running");
            }

            let result = self.executor.execute(spec, &mut stages[i], &ctx).await?;

            match result.status {
                StageStatus::Success => {
                    build.completed_stages += 1;
                    if !self.persist_build(&build).await? {
                        // Someone else finished the build under us
                        cancelled = true;
                    }
                }
                StageStatus::Cancelled => cancelled = true,
                StageStatus::Failed if spec.allow_failure => {
                    warn!(stage = %spec.name, "Stage failed but is allowed to fail");
                }
                StageStatus::Failed => {
                    let reason = result
                        .failure
                        .map(|f| f.to_string())
                        .unwrap_or_else(|| "stage failed".to_string());
                    failed_stage = Some((spec.name.clone(), reason));
                }
                _ => {}
            }
        }

        let status = if cancelled || control.is_cancelled() {
            BuildStatus::Cancelled
        } else if failed_stage.is_some() {
            BuildStatus::Failed
        } else {
            BuildStatus::Success
        };

        build.finish(status, Utc::now());
        let changed = self.persist_build(&build).await?;

        if changed {
            match (&failed_stage, status) {
                (Some((stage, reason)), BuildStatus::Failed) => {
                    error!(build_id = %build_id, stage = %stage, "Build failed: {}", reason);
                    self.sink.emit(BuildEvent::BuildError {
                        build_id: build_id.clone(),
                        stage: Some(stage.clone()),
                        error: reason.clone(),
                    });
                }
                _ => {
                    info!(build_id = %build_id, status = %status, "Build finished");
                    self.sink.emit(BuildEvent::BuildComplete {
                        build_id: build_id.clone(),
                        status,
                    });
                }
            }
        }

        let report = if changed {
            BuildReport { build, stages }
        } else {
            self.status(&build_id).await?
        };

        self.store_summary(&report).await;
        Ok(report)
    }

    async fn skip_stage(&self, build_id: &str, stage: &mut Stage) -> Result<(), OrchestratorError> {
        stage.status = StageStatus::Skipped;
        let snapshot: &Stage = stage;
        let changed = with_retry(&self.settings.status_retry, "stage skip", || {
            self.gateway.update_stage(build_id, snapshot)
        })
        .await?;

        if changed {
            self.sink.emit(BuildEvent::StageComplete {
                build_id: build_id.to_string(),
                stage: stage.name.clone(),
                status: StageStatus::Skipped,
            });
        }
        Ok(())
    }

    async fn persist_build(&self, build: &Build) -> Result<bool, OrchestratorError> {
        let changed = with_retry(&self.settings.status_retry, "build status write", || {
            self.gateway.update_build(build)
        })
        .await?;
        Ok(changed)
    }

    /// Cleanup after the worker died: mark whatever is unfinished as failed
    async fn fail_abnormally(&self, build_id: &str, reason: String) -> BuildReport {
        error!(build_id, "Build worker exited abnormally: {}", reason);

        let now = Utc::now();
        let report = match self.status(build_id).await {
            Ok(report) => report,
            Err(e) => {
                error!(build_id, "Could not load build for cleanup: {}", e);
                let mut build = Build::new(build_id.to_string(), String::new(), 0);
                build.finish(BuildStatus::Failed, now);
                return BuildReport {
                    build,
                    stages: Vec::new(),
                };
            }
        };

        let BuildReport {
            mut build,
            mut stages,
        } = report;

        for stage in stages.iter_mut().filter(|s| !s.status.is_terminal()) {
            match stage.status {
                StageStatus::Running => stage.finish(StageStatus::Failed, now),
                _ => stage.status = StageStatus::Skipped,
            }
            if let Err(e) = self.gateway.update_stage(build_id, stage).await {
                error!(build_id, stage = %stage.name, "Cleanup write failed: {}", e);
            }
        }

        if !build.is_terminal() {
            build.finish(BuildStatus::Failed, now);
            match self.persist_build(&build).await {
                Ok(true) => self.sink.emit(BuildEvent::BuildError {
                    build_id: build_id.to_string(),
                    stage: None,
                    error: reason.clone(),
                }),
                Ok(false) => {}
                Err(e) => error!(build_id, "Cleanup write failed: {}", e),
            }
        }

        let document = LogDocument::new(build_id, DocumentType::Error, "Build Worker Failure", reason);
        if let Err(e) = self.gateway.append_document(&document).await {
            warn!(build_id, "Failed to store worker failure: {}", e);
        }

        BuildReport { build, stages }
    }

    /// Apply control requests queued by other processes
    async fn poll_controls(self, build_id: String) {
        let period = self
            .settings
            .control_poll_interval
            .max(Duration::from_millis(50));
        let mut ticker = tokio::time::interval(period);

        loop {
            ticker.tick().await;
            let requests = match self.gateway.take_controls(&build_id).await {
                Ok(requests) => requests,
                Err(e) => {
                    debug!(build_id = %build_id, "Control poll failed: {}", e);
                    continue;
                }
            };

            for request in requests {
                info!(build_id = %build_id, action = request.action.as_str(), "Control request received");
                let outcome = match request.action {
                    ControlAction::Cancel => self.cancel_build(&build_id).await.map(|_| ()),
                    ControlAction::ForceCancel => {
                        self.force_cancel_build(&build_id).await.map(|_| ())
                    }
                };
                if let Err(e) = outcome {
                    warn!(build_id = %build_id, "Control request failed: {}", e);
                }
            }
        }
    }

    fn acquire_workspace(&self, working_dir: Option<&Path>) -> Result<Option<File>, OrchestratorError> {
        let Some(dir) = working_dir else {
            return Ok(None);
        };

        let holder = self.active.lock().iter().find_map(|(id, active)| {
            (active.control.working_dir.as_deref() == Some(dir)).then(|| id.clone())
        });
        if let Some(holder) = holder {
            return Err(OrchestratorError::AlreadyRunning {
                working_dir: dir.to_path_buf(),
                holder,
            });
        }

        if !dir.is_dir() {
            return Ok(None);
        }

        let path = dir.join(WORKSPACE_LOCK);
        let file = match OpenOptions::new().create(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) => {
                warn!("Could not open {}: {}", path.display(), e);
                return Ok(None);
            }
        };

        file.try_lock_exclusive()
            .map_err(|_| OrchestratorError::AlreadyRunning {
                working_dir: dir.to_path_buf(),
                holder: "another lfsbuild process".to_string(),
            })?;
        Ok(Some(file))
    }

    async fn store_config_document(
        &self,
        build_id: &str,
        config: &BuildConfig,
        working_dir: Option<&Path>,
    ) {
        let content = config.to_yaml().unwrap_or_else(|e| {
            warn!("Could not render config: {}", e);
            String::new()
        });

        let document = LogDocument::new(build_id, DocumentType::Config, "Build Configuration", content)
            .with_metadata(serde_json::json!({
                "config_name": config.name,
                "version": config.version,
                "config_hash": config.config_hash(),
                "total_stages": config.stages.len(),
                "working_dir": working_dir.map(|d| d.display().to_string()),
            }));

        if let Err(e) = self.gateway.append_document(&document).await {
            warn!(build_id, "Failed to store config document: {}", e);
        }
    }

    async fn recorded_working_dir(&self, build_id: &str) -> Option<PathBuf> {
        let documents = self
            .gateway
            .list_documents(build_id, None)
            .await
            .map_err(|e| debug!(build_id, "Could not read documents: {}", e))
            .ok()?;

        documents
            .iter()
            .find(|d| d.document_type == DocumentType::Config)
            .and_then(|d| d.metadata["working_dir"].as_str())
            .map(PathBuf::from)
    }

    async fn store_summary(&self, report: &BuildReport) {
        let build = &report.build;
        let mut content = format!(
            "Build {} finished with status {}\nStages: {}/{} succeeded in {}s\n",
            build.build_id,
            build.status,
            build.completed_stages,
            build.total_stages,
            build.duration_seconds
        );
        for stage in &report.stages {
            let elapsed = stage
                .duration()
                .map(|d| format!(" ({}s)", d.as_secs()))
                .unwrap_or_default();
            content.push_str(&format!("  {}: {}{}\n", stage.name, stage.status, elapsed));
        }

        let document = LogDocument::new(&build.build_id, DocumentType::Summary, "Build Summary", content)
            .with_metadata(serde_json::json!({
                "status": build.status,
                "completed_stages": build.completed_stages,
                "total_stages": build.total_stages,
                "duration_seconds": build.duration_seconds,
            }));

        if let Err(e) = self.gateway.append_document(&document).await {
            warn!(build_id = %build.build_id, "Failed to store summary: {}", e);
        }
    }
}
