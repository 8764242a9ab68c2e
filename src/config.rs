//! Configuration for lfsbuild.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (LFSBUILD_HOME, LFSBUILD_DB, LFSBUILD_LFS_ROOT)
//! 2. Config file (.lfsbuild/config.yaml)
//! 3. Defaults (~/.lfsbuild)
//!
//! Config file discovery:
//! - Searches current directory and parents for .lfsbuild/config.yaml
//! - `home` is relative to the .lfsbuild/ directory, other paths to the
//!   project root (the directory containing .lfsbuild/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::process::{DEFAULT_KILL_PATTERNS, DEFAULT_SUDO_PROMPT};
use crate::core::retry::RetryPolicy;
use crate::core::sudo::STOCK_SUDO_MARKER;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub execution: Option<ExecutionConfig>,
    #[serde(default)]
    pub sudo: Option<SudoConfig>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .lfsbuild/)
    pub home: Option<String>,
    /// SQLite database (relative to project root)
    pub database: Option<String>,
    /// Default working directory for stage commands (relative to project root)
    pub working_dir: Option<String>,
    /// Mount point exported to stages as `LFS`
    pub lfs_root: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionConfig {
    pub grace_period_ms: Option<u64>,
    pub flush_lines: Option<usize>,
    pub flush_interval_ms: Option<u64>,
    pub control_poll_interval_ms: Option<u64>,
    pub kill_patterns: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SudoConfig {
    /// Marker handed to sudo through SUDO_PROMPT
    pub prompt: Option<String>,
    /// Extra substrings that identify a password prompt
    #[serde(default)]
    pub markers: Vec<String>,
}

/// Runtime knobs for the orchestrator
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    /// Time between SIGTERM and SIGKILL
    pub grace_period: Duration,
    /// Output lines per output document
    pub flush_lines: usize,
    /// Longest a partial output batch is held back
    pub flush_interval: Duration,
    /// How often a running build checks the control queue
    pub control_poll_interval: Duration,
    /// Command-line globs used by force cancel
    pub kill_patterns: Vec<String>,
    pub sudo_prompt: String,
    /// Substrings that mark a line as a password prompt
    pub sudo_markers: Vec<String>,
    /// Retry policy for status transitions
    pub status_retry: RetryPolicy,
    /// Exported to every stage as `LFS`
    pub lfs_root: PathBuf,
    /// Used when a build config names no working dir
    pub default_working_dir: Option<PathBuf>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(3),
            flush_lines: 50,
            flush_interval: Duration::from_secs(2),
            control_poll_interval: Duration::from_secs(1),
            kill_patterns: DEFAULT_KILL_PATTERNS.iter().map(|p| p.to_string()).collect(),
            sudo_prompt: DEFAULT_SUDO_PROMPT.to_string(),
            sudo_markers: vec![STOCK_SUDO_MARKER.to_string()],
            status_retry: RetryPolicy::default(),
            lfs_root: PathBuf::from("/mnt/lfs"),
            default_working_dir: None,
        }
    }
}

impl ExecutionSettings {
    /// All markers, including the configured SUDO_PROMPT
    pub fn prompt_markers(&self) -> Vec<String> {
        let mut markers = self.sudo_markers.clone();
        if !markers.contains(&self.sudo_prompt) {
            markers.push(self.sudo_prompt.clone());
        }
        markers
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to lfsbuild home (state directory)
    pub home: PathBuf,
    /// Absolute path to the build database
    pub database: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub execution: ExecutionSettings,
}

/// Find config file by searching a directory and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".lfsbuild").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge a config file (if any) and environment lookups over the defaults
fn resolve(
    config_file: Option<PathBuf>,
    default_home: PathBuf,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ResolvedConfig> {
    let file = config_file.as_deref().map(load_config_file).transpose()?;

    let lfsbuild_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));
    let base_dir = lfsbuild_dir.parent().unwrap_or(Path::new("."));
    let paths = file.as_ref().map(|f| f.paths.clone()).unwrap_or_default();

    let home = match (env("LFSBUILD_HOME"), &paths.home) {
        (Some(env_home), _) => PathBuf::from(env_home),
        (None, Some(home)) => resolve_path(lfsbuild_dir, home),
        (None, None) => default_home,
    };

    let database = match (env("LFSBUILD_DB"), &paths.database) {
        (Some(env_db), _) => PathBuf::from(env_db),
        (None, Some(db)) => resolve_path(base_dir, db),
        (None, None) => home.join("builds.db"),
    };

    let defaults = ExecutionSettings::default();
    let lfs_root = match (env("LFSBUILD_LFS_ROOT"), &paths.lfs_root) {
        (Some(root), _) => PathBuf::from(root),
        (None, Some(root)) => PathBuf::from(root),
        (None, None) => defaults.lfs_root.clone(),
    };

    let exec = file
        .as_ref()
        .and_then(|f| f.execution.clone())
        .unwrap_or_default();
    let sudo = file.as_ref().and_then(|f| f.sudo.clone()).unwrap_or_default();

    let mut sudo_markers = defaults.sudo_markers.clone();
    sudo_markers.extend(sudo.markers);

    let execution = ExecutionSettings {
        grace_period: exec
            .grace_period_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.grace_period),
        flush_lines: exec.flush_lines.unwrap_or(defaults.flush_lines).max(1),
        flush_interval: exec
            .flush_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.flush_interval),
        control_poll_interval: exec
            .control_poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.control_poll_interval),
        kill_patterns: exec.kill_patterns.unwrap_or(defaults.kill_patterns),
        sudo_prompt: sudo.prompt.unwrap_or(defaults.sudo_prompt),
        sudo_markers,
        status_retry: file
            .as_ref()
            .and_then(|f| f.retry.clone())
            .unwrap_or(defaults.status_retry),
        lfs_root,
        default_working_dir: paths.working_dir.as_deref().map(|d| resolve_path(base_dir, d)),
    };

    Ok(ResolvedConfig {
        home,
        database,
        config_file,
        execution,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".lfsbuild");

    let cwd = std::env::current_dir().context("Failed to read current directory")?;

    resolve(find_config_file(&cwd), default_home, |key| std::env::var(key).ok())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}
