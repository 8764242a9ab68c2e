//! Stage executor.
//!
//! Runs one stage through the process runner: streams its output into
//! batched `output` documents and live events, hands password prompts to
//! the sudo relay, and runs the rollback command when the stage fails.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::build_config::StageSpec;
use super::orchestrator::OrchestratorError;
use super::process::{ExitStatus, OutputLine, OutputStream, ProcessHandle, ProcessRunner, ProcessSpec};
use super::retry::with_retry;
use super::sudo::SudoRelay;
use crate::adapters::EventSink;
use crate::config::ExecutionSettings;
use crate::domain::{
    BuildEvent, BuildStatus, DocumentType, LogDocument, Stage, StageFailure, StageResult,
    StageStatus,
};
use crate::store::PersistenceGateway;

/// Bound on how long leftover output is drained after a kill
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Cancellation handles and the live process of one build
#[derive(Debug, Default)]
pub struct BuildControl {
    /// Graceful cancel: SIGTERM, then SIGKILL after the grace period
    pub cancel: CancellationToken,
    /// Force cancel: SIGKILL immediately
    pub force: CancellationToken,
    pub working_dir: Option<PathBuf>,
    current_pid: Mutex<Option<u32>>,
}

impl BuildControl {
    pub fn new(working_dir: Option<PathBuf>) -> Self {
        Self {
            working_dir,
            ..Default::default()
        }
    }

    /// Process group of the running stage, if any
    pub fn current_pid(&self) -> Option<u32> {
        *self.current_pid.lock()
    }

    fn set_pid(&self, pid: Option<u32>) {
        *self.current_pid.lock() = pid;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.force.is_cancelled()
    }
}

/// Everything a stage needs to know about its build
pub struct StageContext<'a> {
    pub build_id: &'a str,
    pub working_dir: Option<&'a Path>,
    /// Build-scoped environment from the config
    pub env: &'a BTreeMap<String, String>,
    pub control: &'a BuildControl,
}

#[derive(Debug)]
enum ExecState {
    Streaming,
    AwaitingCredential { prompt: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Interrupt {
    Cancel,
    Force,
    Declined,
}

enum Step {
    Force,
    Cancel,
    Tick,
    Line(Option<OutputLine>),
}

/// Output lines waiting to be written as one document
struct OutputBatch {
    lines: Vec<String>,
    chunk: u32,
}

impl OutputBatch {
    fn new() -> Self {
        Self {
            lines: Vec::new(),
            chunk: 0,
        }
    }

    fn take(&mut self) -> Option<(u32, Vec<String>)> {
        if self.lines.is_empty() {
            return None;
        }
        self.chunk += 1;
        Some((self.chunk, std::mem::take(&mut self.lines)))
    }
}

/// Executes single stages of a build
pub struct StageExecutor {
    gateway: Arc<dyn PersistenceGateway>,
    runner: ProcessRunner,
    sink: Arc<dyn EventSink>,
    relay: Arc<SudoRelay>,
    settings: ExecutionSettings,
}

impl StageExecutor {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        runner: ProcessRunner,
        sink: Arc<dyn EventSink>,
        relay: Arc<SudoRelay>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            gateway,
            runner,
            sink,
            relay,
            settings,
        }
    }

    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    /// Run a stage to a terminal status.
    ///
    /// Only status writes that exhaust their retries produce an error; every
    /// other failure is recorded on the stage and in the result.
    #[instrument(skip(self, spec, stage, ctx), fields(build_id = %ctx.build_id, stage = %spec.name))]
    pub async fn execute(
        &self,
        spec: &StageSpec,
        stage: &mut Stage,
        ctx: &StageContext<'_>,
    ) -> Result<StageResult, OrchestratorError> {
        let started = Instant::now();

        stage.start(Utc::now());
        self.persist_stage(ctx.build_id, stage).await?;
        self.sink.emit(BuildEvent::StageStart {
            build_id: ctx.build_id.to_string(),
            stage: spec.name.clone(),
        });
        info!("Stage started");

        let process = self.process_spec(&spec.command, spec, ctx);
        let mut handle = match self.runner.spawn(&process) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Failed to spawn stage: {}", e);
                let failure = StageFailure::Spawn(e.to_string());
                stage.error_log.push_str(&format!("{}\n", failure));
                self.write_error_document(ctx.build_id, stage, &failure).await;
                return self
                    .complete(stage, ctx, StageStatus::Failed, None, Some(failure), started)
                    .await;
            }
        };
        ctx.control.set_pid(Some(handle.pid()));

        let mut batch = OutputBatch::new();
        let interrupt = self.stream(&mut handle, stage, ctx, &mut batch).await;
        let (interrupt, exit) = self.finish_process(&mut handle, interrupt, ctx).await;

        if interrupt.is_some() {
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
                while let Some(line) = handle.next_line().await {
                    self.record_line(ctx.build_id, stage, &mut batch, line).await;
                }
            })
            .await;
        }
        self.flush(ctx.build_id, &stage.name, &mut batch).await;
        ctx.control.set_pid(None);

        let (mut status, exit_code, mut failure) = match (interrupt, exit) {
            (Some(Interrupt::Cancel | Interrupt::Force), exit) => (
                StageStatus::Cancelled,
                exit.ok().and_then(|s| s.code),
                Some(StageFailure::Cancelled),
            ),
            (Some(Interrupt::Declined), exit) => (
                StageStatus::Failed,
                exit.ok().and_then(|s| s.code),
                Some(StageFailure::PrivilegeDeclined),
            ),
            (None, Ok(status)) if status.success() => (StageStatus::Success, Some(0), None),
            (None, Ok(status)) => {
                let failure = match (status.code, status.signal) {
                    (Some(code), _) => StageFailure::ExitCode(code),
                    (None, Some(signal)) => StageFailure::Signal(signal),
                    (None, None) => StageFailure::Lost("no exit code or signal".to_string()),
                };
                (StageStatus::Failed, status.code, Some(failure))
            }
            (None, Err(e)) => (StageStatus::Failed, None, Some(StageFailure::Lost(e.to_string()))),
        };

        // Killed by a force cancel issued from another process
        if status == StageStatus::Failed
            && interrupt.is_none()
            && self.build_cancelled(ctx.build_id).await
        {
            info!("Build was cancelled elsewhere; not treating the stage as failed");
            status = StageStatus::Cancelled;
            failure = Some(StageFailure::Cancelled);
        }

        if status == StageStatus::Failed {
            if let Some(failure) = &failure {
                self.write_error_document(ctx.build_id, stage, failure).await;
                if failure.wants_rollback() {
                    self.rollback(spec, ctx).await;
                }
            }
        }

        self.complete(stage, ctx, status, exit_code, failure, started)
            .await
    }

    /// Consume output until the pipes close or something interrupts the stage
    async fn stream(
        &self,
        handle: &mut ProcessHandle,
        stage: &mut Stage,
        ctx: &StageContext<'_>,
        batch: &mut OutputBatch,
    ) -> Option<Interrupt> {
        let period = self.settings.flush_interval.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut state = ExecState::Streaming;
        loop {
            match std::mem::replace(&mut state, ExecState::Streaming) {
                ExecState::Streaming => {
                    let step = tokio::select! {
                        biased;
                        _ = ctx.control.force.cancelled() => Step::Force,
                        _ = ctx.control.cancel.cancelled() => Step::Cancel,
                        _ = ticker.tick() => Step::Tick,
                        line = handle.next_line() => Step::Line(line),
                    };

                    match step {
                        Step::Force => return Some(Interrupt::Force),
                        Step::Cancel => return Some(Interrupt::Cancel),
                        Step::Tick => self.flush(ctx.build_id, &stage.name, batch).await,
                        Step::Line(None) => return None,
                        Step::Line(Some(line)) => {
                            let prompt = self
                                .relay
                                .is_privilege_prompt(&line.text)
                                .then(|| line.text.clone());
                            self.record_line(ctx.build_id, stage, batch, line).await;
                            if let Some(prompt) = prompt {
                                state = ExecState::AwaitingCredential { prompt };
                            }
                        }
                    }
                }
                ExecState::AwaitingCredential { prompt } => {
                    // Make the prompt visible before blocking on it
                    self.flush(ctx.build_id, &stage.name, batch).await;

                    let reason = format!("Stage '{}' requested a password: {}", stage.name, prompt);
                    let credential = self
                        .relay
                        .request_credential(ctx.build_id, &reason, &ctx.control.cancel)
                        .await;

                    match credential {
                        Some(credential) => {
                            let mut answer = credential.expose().as_bytes().to_vec();
                            answer.push(b'\n');
                            if let Err(e) = handle.write_stdin(&answer).await {
                                warn!("Failed to pass credential to stage: {}", e);
                            }
                        }
                        None if ctx.control.force.is_cancelled() => return Some(Interrupt::Force),
                        None if ctx.control.cancel.is_cancelled() => return Some(Interrupt::Cancel),
                        None => {
                            info!("Sudo credential declined");
                            return Some(Interrupt::Declined);
                        }
                    }
                }
            }
        }
    }

    /// Reap the process, terminating it first if the stage was interrupted.
    /// A cancel that lands while waiting for exit also counts.
    async fn finish_process(
        &self,
        handle: &mut ProcessHandle,
        interrupt: Option<Interrupt>,
        ctx: &StageContext<'_>,
    ) -> (Option<Interrupt>, Result<ExitStatus, String>) {
        let (interrupt, exit) = match interrupt {
            Some(Interrupt::Force) => (interrupt, handle.terminate(true).await),
            Some(_) => (interrupt, handle.terminate(false).await),
            None => {
                let waited = tokio::select! {
                    biased;
                    _ = ctx.control.force.cancelled() => Err(Interrupt::Force),
                    _ = ctx.control.cancel.cancelled() => Err(Interrupt::Cancel),
                    status = handle.wait() => Ok(status),
                };
                match waited {
                    Ok(status) => (None, status),
                    Err(interrupt) => (
                        Some(interrupt),
                        handle.terminate(interrupt == Interrupt::Force).await,
                    ),
                }
            }
        };

        (interrupt, exit.map_err(|e| e.to_string()))
    }

    async fn record_line(
        &self,
        build_id: &str,
        stage: &mut Stage,
        batch: &mut OutputBatch,
        line: OutputLine,
    ) {
        let log = match line.stream {
            OutputStream::Stdout => &mut stage.output_log,
            OutputStream::Stderr => &mut stage.error_log,
        };
        log.push_str(&line.text);
        log.push('\n');

        self.sink.emit(BuildEvent::StageOutput {
            build_id: build_id.to_string(),
            stage: stage.name.clone(),
            line: line.text.clone(),
        });

        batch.lines.push(line.text);
        if batch.lines.len() >= self.settings.flush_lines {
            self.flush(build_id, &stage.name, batch).await;
        }
    }

    /// Write buffered output as one `output` document. Failures are logged.
    async fn flush(&self, build_id: &str, stage: &str, batch: &mut OutputBatch) {
        let Some((chunk, lines)) = batch.take() else {
            return;
        };

        let mut content = lines.join("\n");
        content.push('\n');

        let document = LogDocument::new(
            build_id,
            DocumentType::Output,
            format!("Output: {} #{}", stage, chunk),
            content,
        )
        .for_stage(stage)
        .with_metadata(serde_json::json!({ "chunk": chunk, "lines": lines.len() }));

        if let Err(e) = self.gateway.append_document(&document).await {
            warn!(chunk, "Failed to store stage output: {}", e);
        }
    }

    async fn write_error_document(&self, build_id: &str, stage: &Stage, failure: &StageFailure) {
        let content = if stage.error_log.trim().is_empty() {
            failure.to_string()
        } else {
            stage.error_log.clone()
        };

        let document = LogDocument::new(
            build_id,
            DocumentType::Error,
            format!("Error: {}", stage.name),
            content,
        )
        .for_stage(&stage.name)
        .with_metadata(serde_json::json!({ "failure": failure.to_string() }));

        if let Err(e) = self.gateway.append_document(&document).await {
            warn!("Failed to store stage error: {}", e);
        }
    }

    /// Best effort: the outcome is recorded, never propagated
    async fn rollback(&self, spec: &StageSpec, ctx: &StageContext<'_>) {
        let Some(command) = spec.rollback() else {
            return;
        };
        info!(command, "Running rollback");

        let process = self.process_spec(command, spec, ctx);
        let (content, exit_code) = match self.runner.spawn(&process) {
            Ok(mut handle) => {
                let mut output = String::new();
                let exit = tokio::select! {
                    biased;
                    _ = ctx.control.force.cancelled() => handle.terminate(true).await,
                    exit = async {
                        while let Some(line) = handle.next_line().await {
                            output.push_str(&line.text);
                            output.push('\n');
                        }
                        handle.wait().await
                    } => exit,
                };
                match exit {
                    Ok(status) => (output, status.code),
                    Err(e) => (format!("{}{}\n", output, e), None),
                }
            }
            Err(e) => (e.to_string(), None),
        };

        if exit_code != Some(0) {
            warn!(?exit_code, "Rollback did not succeed");
        }

        let document = LogDocument::new(
            ctx.build_id,
            DocumentType::Log,
            format!("Rollback: {}", spec.name),
            content,
        )
        .for_stage(&spec.name)
        .with_metadata(serde_json::json!({
            "rollback": true,
            "command": command,
            "exit_code": exit_code,
        }));

        if let Err(e) = self.gateway.append_document(&document).await {
            warn!("Failed to store rollback output: {}", e);
        }
    }

    async fn complete(
        &self,
        stage: &mut Stage,
        ctx: &StageContext<'_>,
        status: StageStatus,
        exit_code: Option<i32>,
        failure: Option<StageFailure>,
        started: Instant,
    ) -> Result<StageResult, OrchestratorError> {
        stage.finish(status, Utc::now());
        if !self.persist_stage(ctx.build_id, stage).await? {
            debug!("Stage row was already terminal");
        }

        self.sink.emit(BuildEvent::StageComplete {
            build_id: ctx.build_id.to_string(),
            stage: stage.name.clone(),
            status,
        });
        info!(status = %status, "Stage complete");

        Ok(StageResult {
            stage: stage.name.clone(),
            status,
            exit_code,
            failure,
            duration: started.elapsed(),
        })
    }

    async fn build_cancelled(&self, build_id: &str) -> bool {
        match self.gateway.get_build(build_id).await {
            Ok(Some(build)) => build.status == BuildStatus::Cancelled,
            Ok(None) => false,
            Err(e) => {
                warn!("Could not read build status: {}", e);
                false
            }
        }
    }

    async fn persist_stage(&self, build_id: &str, stage: &Stage) -> Result<bool, OrchestratorError> {
        let gateway = &self.gateway;
        let changed = with_retry(&self.settings.status_retry, "stage status write", || {
            gateway.update_stage(build_id, stage)
        })
        .await?;
        Ok(changed)
    }

    fn process_spec(&self, command: &str, spec: &StageSpec, ctx: &StageContext<'_>) -> ProcessSpec {
        let mut env = ctx.env.clone();
        env.insert("LFS".to_string(), self.settings.lfs_root.display().to_string());
        env.insert("LFSBUILD_BUILD_ID".to_string(), ctx.build_id.to_string());
        env.insert("LFSBUILD_STAGE".to_string(), spec.name.clone());

        ProcessSpec {
            command: command.to_string(),
            working_dir: ctx.working_dir.map(Path::to_path_buf),
            env,
        }
    }
}
