//! Process runner for stage commands.
//!
//! Every command runs as `bash -c <command>` in its own process group so a
//! single signal reaches the whole pipeline of children. Output from both
//! pipes is delivered line by line in arrival order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Marker written by sudo (through `SUDO_PROMPT`) when it wants a password
pub const DEFAULT_SUDO_PROMPT: &str = "[lfsbuild] sudo password required";

/// Command-line globs that identify build processes during a tree scan
pub const DEFAULT_KILL_PATTERNS: &[&str] = &[
    "*bash scripts/*",
    "*prepare_host.sh*",
    "*download_sources.sh*",
    "*build_toolchain.sh*",
    "*build_temp_system.sh*",
    "*enter_chroot.sh*",
    "*build_final_system.sh*",
    "*/mnt/lfs*",
];

/// Routes `sudo` through stdin so the relay can answer its prompt
const SUDO_PREAMBLE: &str = "sudo() { command sudo -S \"$@\"; }; export -f sudo\n";

/// Errors from launching or signalling processes
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Process I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("Process table scan failed: {0}")]
    Scan(String),
}

/// What to run
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub command: String,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl ProcessSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn in_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of process output, without its trailing newline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// A process killed by a tree scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminatedProcess {
    pub pid: u32,
    pub name: String,
    /// Needed SIGKILL after ignoring SIGTERM
    pub forced: bool,
}

/// Spawns stage commands and tears down their process trees
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    grace_period: Duration,
    sudo_prompt: String,
    kill_patterns: Vec<glob::Pattern>,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

impl ProcessRunner {
    /// Create a runner with the default sudo marker and kill patterns
    pub fn new(grace_period: Duration) -> Self {
        Self {
            grace_period,
            sudo_prompt: DEFAULT_SUDO_PROMPT.to_string(),
            kill_patterns: compile_patterns(DEFAULT_KILL_PATTERNS.iter().copied()),
        }
    }

    pub fn with_sudo_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.sudo_prompt = prompt.into();
        self
    }

    /// Replace the tree-scan patterns. Invalid globs are skipped with a warning.
    pub fn with_kill_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let owned: Vec<S> = patterns.into_iter().collect();
        self.kill_patterns = compile_patterns(owned.iter().map(|p| p.as_ref()));
        self
    }

    /// Launch a command
    pub fn spawn(&self, spec: &ProcessSpec) -> Result<ProcessHandle, ProcessError> {
        let script = format!("{}{}", SUDO_PREAMBLE, spec.command);

        let mut command = Command::new("bash");
        command
            .arg("-c")
            .arg(&script)
            .envs(&spec.env)
            .env("SUDO_PROMPT", format!("{}\n", self.sudo_prompt))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            command: spec.command.clone(),
            source,
        })?;

        let pid = child.id().ok_or_else(|| ProcessError::Spawn {
            command: spec.command.clone(),
            source: io::Error::new(io::ErrorKind::Other, "process exited before its pid was read"),
        })?;

        let (tx, rx) = mpsc::channel(1024);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, OutputStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, OutputStream::Stderr, tx));
        }

        debug!(pid, command = %spec.command, "Spawned stage process");

        Ok(ProcessHandle {
            stdin: child.stdin.take(),
            child,
            pid,
            lines: rx,
            grace_period: self.grace_period,
        })
    }

    /// Kill everything that belongs to a build: descendants of `root`,
    /// processes whose command line matches a kill pattern or mentions the
    /// build id, and processes running inside the build's working dir.
    ///
    /// Matches get SIGTERM, survivors get SIGKILL after the grace period.
    pub async fn terminate_tree(
        &self,
        root: Option<u32>,
        build_id: &str,
        working_dir: Option<&Path>,
    ) -> Result<Vec<TerminatedProcess>, ProcessError> {
        let scan = TreeScan {
            root,
            build_id: build_id.to_string(),
            working_dir: working_dir.filter(|d| *d != Path::new("/")).map(Path::to_path_buf),
            patterns: self.kill_patterns.clone(),
        };
        let grace = self.grace_period;

        tokio::task::spawn_blocking(move || scan.run(grace))
            .await
            .map_err(|e| ProcessError::Scan(e.to_string()))?
    }
}

fn compile_patterns<'a>(patterns: impl Iterator<Item = &'a str>) -> Vec<glob::Pattern> {
    patterns
        .filter_map(|p| match glob::Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!("Ignoring invalid kill pattern '{}': {}", p, e);
                None
            }
        })
        .collect()
}

async fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let text = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(OutputLine { stream, text }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Output pipe closed: {}", e);
                break;
            }
        }
    }
}

/// A running stage process
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    stdin: Option<ChildStdin>,
    lines: mpsc::Receiver<OutputLine>,
    grace_period: Duration,
}

impl ProcessHandle {
    /// Process id, which is also the process group id
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Next output line. `None` once both pipes have closed.
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        self.lines.recv().await
    }

    /// Wait for the process to exit
    pub async fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
        // Closing stdin keeps a read on it from blocking exit
        self.stdin.take();
        Ok(self.child.wait().await?.into())
    }

    /// Write raw bytes to the process's stdin
    pub async fn write_stdin(&mut self, bytes: &[u8]) -> Result<(), ProcessError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin already closed"))?;
        stdin.write_all(bytes).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Stop the process group. Graceful sends SIGTERM and escalates to
    /// SIGKILL after the grace period; force goes straight to SIGKILL.
    pub async fn terminate(&mut self, force: bool) -> Result<ExitStatus, ProcessError> {
        if let Some(status) = self.child.try_wait()? {
            // The leader is gone but its group may not be
            let _ = signal_group(self.pid, libc::SIGKILL);
            return Ok(status.into());
        }

        if !force {
            signal_group(self.pid, libc::SIGTERM)?;
            match tokio::time::timeout(self.grace_period, self.child.wait()).await {
                Ok(status) => {
                    let _ = signal_group(self.pid, libc::SIGKILL);
                    return Ok(status?.into());
                }
                Err(_) => {
                    info!(pid = self.pid, "Process ignored SIGTERM, sending SIGKILL");
                }
            }
        }

        signal_group(self.pid, libc::SIGKILL)?;
        Ok(self.child.wait().await?.into())
    }
}

/// Send a signal to a whole process group. A group that no longer exists
/// is not an error.
pub fn signal_group(pgid: u32, signal: i32) -> Result<(), ProcessError> {
    // SAFETY: killpg has no memory-safety preconditions
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
    check_signal(pgid, rc)
}

fn signal_process(pid: u32, signal: i32) -> Result<(), ProcessError> {
    // SAFETY: kill has no memory-safety preconditions
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    check_signal(pid, rc)
}

fn check_signal(pid: u32, rc: i32) -> Result<(), ProcessError> {
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(ProcessError::Signal { pid, source: err })
    }
}

struct TreeScan {
    root: Option<u32>,
    build_id: String,
    working_dir: Option<PathBuf>,
    patterns: Vec<glob::Pattern>,
}

impl TreeScan {
    fn run(self, grace: Duration) -> Result<Vec<TerminatedProcess>, ProcessError> {
        let refresh = ProcessRefreshKind::nothing()
            .with_cmd(UpdateKind::Always)
            .with_cwd(UpdateKind::Always);

        let mut system = System::new();
        system.refresh_processes_specifics(ProcessesToUpdate::All, true, refresh);

        let matches = self.find_matches(&system)?;
        if matches.is_empty() {
            return Ok(Vec::new());
        }

        for (pid, name) in &matches {
            debug!(pid, name = %name, "Sending SIGTERM");
            if let Err(e) = signal_process(*pid, libc::SIGTERM) {
                warn!("{}", e);
            }
        }

        let deadline = Instant::now() + grace;
        let pids: Vec<Pid> = matches.keys().map(|p| Pid::from_u32(*p)).collect();
        let mut alive: HashSet<u32> = matches.keys().copied().collect();

        while !alive.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(100));
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&pids),
                true,
                ProcessRefreshKind::nothing(),
            );
            alive.retain(|pid| is_alive(&system, *pid));
        }

        for pid in &alive {
            info!(pid, "Process survived SIGTERM, sending SIGKILL");
            if let Err(e) = signal_process(*pid, libc::SIGKILL) {
                warn!("{}", e);
            }
        }

        Ok(matches
            .into_iter()
            .map(|(pid, name)| TerminatedProcess {
                forced: alive.contains(&pid),
                pid,
                name,
            })
            .collect())
    }

    fn find_matches(&self, system: &System) -> Result<HashMap<u32, String>, ProcessError> {
        let me = sysinfo::get_current_pid().map_err(|e| ProcessError::Scan(e.to_string()))?;

        // Never kill ourselves or whatever launched us
        let mut protected = HashSet::new();
        let mut cursor = Some(me);
        while let Some(pid) = cursor {
            if !protected.insert(pid) {
                break;
            }
            cursor = system.process(pid).and_then(|p| p.parent());
        }

        let mut matches = HashMap::new();
        for (pid, process) in system.processes() {
            if protected.contains(pid) || process.status() == ProcessStatus::Zombie {
                continue;
            }

            let cmdline = process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ");

            let hit = self.is_descendant(system, *pid)
                || (!self.build_id.is_empty() && cmdline.contains(&self.build_id))
                || self.patterns.iter().any(|p| p.matches(&cmdline))
                || matches!(
                    (&self.working_dir, process.cwd()),
                    (Some(dir), Some(cwd)) if cwd.starts_with(dir)
                );

            if hit {
                matches.insert(pid.as_u32(), process.name().to_string_lossy().into_owned());
            }
        }
        Ok(matches)
    }

    fn is_descendant(&self, system: &System, pid: Pid) -> bool {
        let Some(root) = self.root.map(Pid::from_u32) else {
            return false;
        };

        let mut cursor = Some(pid);
        let mut hops = 0;
        while let Some(current) = cursor {
            if current == root {
                return true;
            }
            hops += 1;
            if hops > 256 {
                return false;
            }
            cursor = system.process(current).and_then(|p| p.parent());
        }
        false
    }
}

fn is_alive(system: &System, pid: u32) -> bool {
    system
        .process(Pid::from_u32(pid))
        .map(|p| p.status() != ProcessStatus::Zombie)
        .unwrap_or(false)
}
