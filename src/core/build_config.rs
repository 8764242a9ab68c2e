//! Build config definitions and loading.
//!
//! Build configs are defined in YAML and consist of named stages, each with
//! a shell command, a declared `order`, and a set of dependencies. Loading
//! validates the dependency graph and fixes the execution order once.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors raised while loading a build config
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read build config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse build config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Build config has no stages")]
    EmptyConfig,

    #[error("Stage {index} has an empty {field}")]
    EmptyField { index: usize, field: &'static str },

    #[error("Stage '{0}' is declared more than once")]
    DuplicateStage(String),

    #[error("Stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },

    #[error("Cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },
}

/// One stage as declared in the config document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Stage name (unique within the config)
    pub name: String,

    /// Tie-break for stages whose dependencies do not fix an order
    pub order: i64,

    /// Shell command, run through `bash -c`
    pub command: String,

    /// Names of stages that must finish first
    #[serde(default)]
    pub dependencies: BTreeSet<String>,

    /// Command run when the stage fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_command: Option<String>,

    /// Let the build continue when this stage fails
    #[serde(default)]
    pub allow_failure: bool,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, order: i64, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            order,
            command: command.into(),
            dependencies: BTreeSet::new(),
            rollback_command: None,
            allow_failure: false,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_rollback(mut self, command: impl Into<String>) -> Self {
        self.rollback_command = Some(command.into());
        self
    }

    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    /// The rollback command, if one is set and not blank
    pub fn rollback(&self) -> Option<&str> {
        self.rollback_command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

/// Raw config document (matches YAML structure)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub name: String,

    #[serde(default)]
    pub version: String,

    /// Build-scoped environment passed to every stage
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    /// Working directory for stage commands
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    pub stages: Vec<StageSpec>,
}

/// Index of a stage in a [`StageGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub usize);

/// Dependency graph over the stages of a config, built once at load time
#[derive(Debug, Clone)]
pub struct StageGraph {
    deps: Vec<Vec<StageId>>,
    order: Vec<StageId>,
}

impl StageGraph {
    /// Build and validate the graph. Stage names must already be unique.
    fn build(stages: &[StageSpec]) -> Result<Self, ConfigError> {
        let index: HashMap<&str, StageId> = stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), StageId(i)))
            .collect();

        let mut deps = Vec::with_capacity(stages.len());
        for stage in stages {
            let mut edges = Vec::with_capacity(stage.dependencies.len());
            for dep in &stage.dependencies {
                let id = index
                    .get(dep.as_str())
                    .ok_or_else(|| ConfigError::UnknownDependency {
                        stage: stage.name.clone(),
                        dependency: dep.clone(),
                    })?;
                edges.push(*id);
            }
            deps.push(edges);
        }

        if let Some(cycle) = find_cycle(&deps) {
            return Err(ConfigError::CyclicDependency {
                cycle: cycle
                    .into_iter()
                    .map(|id| stages[id.0].name.clone())
                    .collect(),
            });
        }

        let order = topological_order(stages, &deps);
        Ok(Self { deps, order })
    }

    /// Direct dependencies of a stage
    pub fn dependencies(&self, id: StageId) -> &[StageId] {
        &self.deps[id.0]
    }

    /// Execution order: every stage after its dependencies, ties broken by `order`
    pub fn order(&self) -> &[StageId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }
}

/// Depth-first search for a cycle. Returns the cycle path with the first
/// stage repeated at the end.
fn find_cycle(deps: &[Vec<StageId>]) -> Option<Vec<StageId>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        OnPath,
        Done,
    }

    fn visit(
        node: StageId,
        deps: &[Vec<StageId>],
        marks: &mut [Mark],
        path: &mut Vec<StageId>,
    ) -> Option<Vec<StageId>> {
        marks[node.0] = Mark::OnPath;
        path.push(node);

        for &next in &deps[node.0] {
            match marks[next.0] {
                Mark::OnPath => {
                    let start = path.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::New => {
                    if let Some(cycle) = visit(next, deps, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        path.pop();
        marks[node.0] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::New; deps.len()];
    let mut path = Vec::new();

    for i in 0..deps.len() {
        if marks[i] == Mark::New {
            if let Some(cycle) = visit(StageId(i), deps, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Kahn's algorithm with a min-heap on `(order, declaration index)`.
/// The graph must be acyclic.
fn topological_order(stages: &[StageSpec], deps: &[Vec<StageId>]) -> Vec<StageId> {
    let mut remaining: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<StageId>> = vec![Vec::new(); deps.len()];
    for (i, edges) in deps.iter().enumerate() {
        for dep in edges {
            dependents[dep.0].push(StageId(i));
        }
    }

    let mut ready: BinaryHeap<Reverse<(i64, usize)>> = remaining
        .iter()
        .enumerate()
        .filter(|(_, &n)| n == 0)
        .map(|(i, _)| Reverse((stages[i].order, i)))
        .collect();

    let mut order = Vec::with_capacity(deps.len());
    while let Some(Reverse((_, i))) = ready.pop() {
        order.push(StageId(i));
        for &next in &dependents[i] {
            remaining[next.0] -= 1;
            if remaining[next.0] == 0 {
                ready.push(Reverse((stages[next.0].order, next.0)));
            }
        }
    }
    order
}

/// A validated build config
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub name: String,
    pub version: String,
    pub environment: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub stages: Vec<StageSpec>,
    graph: StageGraph,
    hash: String,
}

impl BuildConfig {
    /// Load a build config from a YAML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate a build config from YAML content
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let document: ConfigDocument = serde_yaml::from_str(content)?;
        Self::from_document(document, hash_content(content))
    }

    /// Validate an already-parsed document
    pub fn from_document(mut document: ConfigDocument, hash: String) -> Result<Self, ConfigError> {
        if document.stages.is_empty() {
            return Err(ConfigError::EmptyConfig);
        }

        let mut seen = BTreeSet::new();
        for (index, stage) in document.stages.iter_mut().enumerate() {
            stage.name = stage.name.trim().to_string();
            if stage.name.is_empty() {
                return Err(ConfigError::EmptyField { index, field: "name" });
            }
            if stage.command.trim().is_empty() {
                return Err(ConfigError::EmptyField { index, field: "command" });
            }
            if !seen.insert(stage.name.clone()) {
                return Err(ConfigError::DuplicateStage(stage.name.clone()));
            }
            // Older configs write `rollback_command: ""` for "none"
            if stage.rollback().is_none() {
                stage.rollback_command = None;
            }
        }

        let graph = StageGraph::build(&document.stages)?;

        Ok(Self {
            name: document.name,
            version: document.version,
            environment: document.environment,
            working_dir: document.working_dir,
            stages: document.stages,
            graph,
            hash,
        })
    }

    /// The stage graph
    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    /// Stages in execution order
    pub fn execution_order(&self) -> Vec<&StageSpec> {
        self.graph.order().iter().map(|id| &self.stages[id.0]).collect()
    }

    /// Look up a stage by name
    pub fn get_stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Short content hash of the source document
    pub fn config_hash(&self) -> &str {
        &self.hash
    }

    /// Convert back into a serializable document
    pub fn to_document(&self) -> ConfigDocument {
        ConfigDocument {
            name: self.name.clone(),
            version: self.version.clone(),
            environment: self.environment.clone(),
            working_dir: self.working_dir.clone(),
            stages: self.stages.clone(),
        }
    }

    /// Render as YAML
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(&self.to_document())?)
    }

    /// The stock eight-stage LFS build
    pub fn default_lfs() -> Result<Self, ConfigError> {
        let stage = |name: &str, order: i64, script: &str, dep: Option<&str>, rollback: &str| {
            StageSpec::new(name, order, format!("bash scripts/{}.sh", script))
                .depends_on(dep)
                .with_rollback(rollback)
        };

        let document = ConfigDocument {
            name: "Linux From Scratch Build".to_string(),
            version: "12.0".to_string(),
            environment: BTreeMap::new(),
            working_dir: None,
            stages: vec![
                stage("prepare_host", 1, "prepare_host", None, "bash scripts/cleanup_host.sh"),
                stage(
                    "create_partition",
                    2,
                    "create_partition",
                    Some("prepare_host"),
                    "bash scripts/remove_partition.sh",
                ),
                stage(
                    "download_sources",
                    3,
                    "download_sources",
                    Some("create_partition"),
                    "rm -rf /mnt/lfs/sources/*",
                ),
                stage(
                    "build_toolchain",
                    4,
                    "build_toolchain",
                    Some("download_sources"),
                    "rm -rf /mnt/lfs/tools/*",
                ),
                stage(
                    "build_system",
                    5,
                    "build_system",
                    Some("build_toolchain"),
                    "bash scripts/cleanup_system.sh",
                ),
                stage(
                    "configure_system",
                    6,
                    "configure_system",
                    Some("build_system"),
                    "bash scripts/reset_config.sh",
                ),
                stage(
                    "build_kernel",
                    7,
                    "build_kernel",
                    Some("configure_system"),
                    "rm -rf /mnt/lfs/boot/*",
                ),
                stage(
                    "finalize_system",
                    8,
                    "finalize_system",
                    Some("build_kernel"),
                    "bash scripts/cleanup_final.sh",
                ),
            ],
        };

        let yaml = serde_yaml::to_string(&document)?;
        Self::from_document(document, hash_content(&yaml))
    }

    /// Write the stock LFS config to a file
    pub fn write_default(path: &Path) -> Result<(), ConfigError> {
        let yaml = Self::default_lfs()?.to_yaml()?;
        std::fs::write(path, yaml).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Hash config content (first 16 hex chars of SHA256)
pub fn hash_content(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CONFIG_YAML: &str = r#"
name: test
version: "1.0"
environment:
  LFS: /mnt/lfs

stages:
  - name: prepare
    order: 1
    command: echo prepare
    dependencies: []

  - name: build
    order: 2
    command: echo build
    dependencies: [prepare]
    rollback_command: echo undo
"#;

    fn names(config: &BuildConfig) -> Vec<&str> {
        config.execution_order().iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_config_parsing() {
        let config = BuildConfig::from_yaml(TEST_CONFIG_YAML).unwrap();

        assert_eq!(config.name, "test");
        assert_eq!(config.stages.len(), 2);
        assert_eq!(config.environment.get("LFS").map(String::as_str), Some("/mnt/lfs"));
        assert_eq!(config.get_stage("build").unwrap().rollback(), Some("echo undo"));
        assert_eq!(config.config_hash().len(), 16);
        assert_eq!(names(&config), vec!["prepare", "build"]);
    }

    #[test]
    fn test_dependencies_override_order() {
        let yaml = r#"
name: reversed
stages:
  - name: late
    order: 1
    command: "true"
    dependencies: [early]
  - name: early
    order: 9
    command: "true"
"#;
        let config = BuildConfig::from_yaml(yaml).unwrap();
        assert_eq!(names(&config), vec!["early", "late"]);
    }

    #[test]
    fn test_order_breaks_ties() {
        let config = BuildConfig::from_document(
            ConfigDocument {
                name: "fan".to_string(),
                version: String::new(),
                environment: BTreeMap::new(),
                working_dir: None,
                stages: vec![
                    StageSpec::new("a", 1, "true"),
                    StageSpec::new("c", 3, "true").depends_on(["a"]),
                    StageSpec::new("b", 2, "true").depends_on(["a"]),
                ],
            },
            String::new(),
        )
        .unwrap();

        assert_eq!(names(&config), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_unknown_dependency() {
        let yaml = r#"
name: invalid
stages:
  - name: first
    order: 1
    command: "true"
    dependencies: [nonexistent]
"#;
        match BuildConfig::from_yaml(yaml) {
            Err(ConfigError::UnknownDependency { stage, dependency }) => {
                assert_eq!(stage, "first");
                assert_eq!(dependency, "nonexistent");
            }
            other => panic!("expected UnknownDependency, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_is_reported() {
        let yaml = r#"
name: cyclic
stages:
  - name: a
    order: 1
    command: "true"
    dependencies: [c]
  - name: b
    order: 2
    command: "true"
    dependencies: [a]
  - name: c
    order: 3
    command: "true"
    dependencies: [b]
"#;
        match BuildConfig::from_yaml(yaml) {
            Err(ConfigError::CyclicDependency { cycle }) => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
            }
            other => panic!("expected CyclicDependency, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let yaml = r#"
name: selfish
stages:
  - name: a
    order: 1
    command: "true"
    dependencies: [a]
"#;
        assert!(matches!(
            BuildConfig::from_yaml(yaml),
            Err(ConfigError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_duplicate_and_empty_stages() {
        let dup = r#"
name: dup
stages:
  - { name: a, order: 1, command: "true" }
  - { name: a, order: 2, command: "true" }
"#;
        assert!(matches!(
            BuildConfig::from_yaml(dup),
            Err(ConfigError::DuplicateStage(_))
        ));

        let empty = "name: empty\nstages: []\n";
        assert!(matches!(BuildConfig::from_yaml(empty), Err(ConfigError::EmptyConfig)));

        let blank = r#"
name: blank
stages:
  - { name: a, order: 1, command: "  " }
"#;
        assert!(matches!(
            BuildConfig::from_yaml(blank),
            Err(ConfigError::EmptyField { field: "command", .. })
        ));
    }

    #[test]
    fn test_blank_rollback_is_none() {
        let yaml = r#"
name: legacy
stages:
  - { name: a, order: 1, command: "true", rollback_command: "" }
"#;
        let config = BuildConfig::from_yaml(yaml).unwrap();
        assert!(config.stages[0].rollback_command.is_none());
    }

    #[test]
    fn test_default_lfs_config() {
        let config = BuildConfig::default_lfs().unwrap();
        let order = names(&config);

        assert_eq!(order.len(), 8);
        assert_eq!(order.first(), Some(&"prepare_host"));
        assert_eq!(order.last(), Some(&"finalize_system"));

        // Each stock stage waits on the one before it
        let graph = config.graph();
        let first = graph.order()[0];
        assert!(graph.dependencies(first).is_empty());
        for pair in graph.order().windows(2) {
            assert_eq!(graph.dependencies(pair[1]), &[pair[0]]);
        }

        // Survives a YAML round trip
        let reparsed = BuildConfig::from_yaml(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(names(&reparsed), order);
    }
}
