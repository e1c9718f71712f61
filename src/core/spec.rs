//! Spec data model.
//!
//! A spec is a declarative unit of work: ordered phases of task definitions,
//! dependencies on other specs, prerequisite checks and an optional config
//! overlay. Specs are immutable once loaded; parsing the spec document format
//! itself happens elsewhere and arrives here as a manifest.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::{sflog_debug, Error, Result};

/// Identifier of a spec within a spec set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecId(pub String);

impl SpecId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SpecId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Borrow<str> for SpecId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A dependency on another spec.
///
/// Manifests may give a dependency as a bare id string (waits for completion)
/// or as a table with an explicit `wait_for_completion` flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "DependencyRepr")]
pub struct SpecDependency {
    pub spec: SpecId,
    /// When true the dependency must be `complete` before this spec starts.
    /// When false it only orders execution levels.
    pub wait_for_completion: bool,
}

impl SpecDependency {
    pub fn on(spec: impl Into<String>) -> Self {
        Self {
            spec: SpecId::new(spec),
            wait_for_completion: true,
        }
    }

    pub fn ordering_only(spec: impl Into<String>) -> Self {
        Self {
            spec: SpecId::new(spec),
            wait_for_completion: false,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DependencyRepr {
    Id(String),
    Full {
        spec: String,
        #[serde(default = "default_true")]
        wait_for_completion: bool,
    },
}

fn default_true() -> bool {
    true
}

impl From<DependencyRepr> for SpecDependency {
    fn from(repr: DependencyRepr) -> Self {
        match repr {
            DependencyRepr::Id(spec) => SpecDependency::on(spec),
            DependencyRepr::Full {
                spec,
                wait_for_completion,
            } => SpecDependency {
                spec: SpecId(spec),
                wait_for_completion,
            },
        }
    }
}

/// A task as declared in a spec phase, before materialisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: crate::core::task::TaskPriority,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Files the task is expected to touch; used as context hints.
    #[serde(default)]
    pub files: Vec<String>,
}

impl TaskDefinition {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: String::new(),
            priority: Default::default(),
            dependencies: Vec::new(),
            files: Vec::new(),
        }
    }
}

/// An ordered group of tasks inside a spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
}

/// A check that must pass before a spec may start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prerequisite {
    pub name: String,
    #[serde(flatten)]
    pub check: PrerequisiteCheck,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PrerequisiteCheck {
    /// Shell command; exit status zero passes.
    Command { run: String },
    /// Path relative to the workspace root must exist.
    FileExists { path: String },
    /// Environment variable must be set and non-empty.
    EnvVar { name: String },
}

/// Per-spec configuration overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecConfigOverlay {
    #[serde(default)]
    pub stall_threshold: Option<u32>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub test_command: Option<String>,
    #[serde(default)]
    pub allowed_paths: Option<Vec<String>>,
    #[serde(default)]
    pub rules: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    pub id: SpecId,
    #[serde(default)]
    pub path: PathBuf,
    #[serde(default)]
    pub dependencies: Vec<SpecDependency>,
    #[serde(default)]
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default)]
    pub config: Option<SpecConfigOverlay>,
}

impl Spec {
    pub fn new(id: &str) -> Self {
        Self {
            id: SpecId::new(id),
            path: PathBuf::new(),
            dependencies: Vec::new(),
            phases: Vec::new(),
            prerequisites: Vec::new(),
            config: None,
        }
    }

    /// Builder-style helper: add a waiting dependency.
    pub fn depends_on(mut self, spec: &str) -> Self {
        self.dependencies.push(SpecDependency::on(spec));
        self
    }

    /// Builder-style helper: append a phase.
    pub fn with_phase(mut self, name: &str, tasks: Vec<TaskDefinition>) -> Self {
        self.phases.push(Phase {
            name: name.to_string(),
            tasks,
        });
        self
    }

    pub fn dependency_ids(&self) -> impl Iterator<Item = &SpecId> {
        self.dependencies.iter().map(|d| &d.spec)
    }

    /// Dependencies that must be complete before this spec starts.
    pub fn blocking_dependencies(&self) -> impl Iterator<Item = &SpecId> {
        self.dependencies
            .iter()
            .filter(|d| d.wait_for_completion)
            .map(|d| &d.spec)
    }

    /// Every task definition paired with its phase name, in declaration order.
    pub fn task_definitions(&self) -> impl Iterator<Item = (&str, &TaskDefinition)> {
        self.phases
            .iter()
            .flat_map(|phase| phase.tasks.iter().map(move |t| (phase.name.as_str(), t)))
    }

    pub fn task_count(&self) -> usize {
        self.phases.iter().map(|p| p.tasks.len()).sum()
    }
}

/// A collection of specs executed together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecSet {
    pub id: String,
    #[serde(default)]
    pub specs: Vec<Spec>,
}

impl SpecSet {
    pub fn new(id: &str, specs: Vec<Spec>) -> Self {
        Self {
            id: id.to_string(),
            specs,
        }
    }

    pub fn find(&self, id: &str) -> Option<&Spec> {
        self.specs.iter().find(|s| s.id.as_str() == id)
    }

    /// Load a spec-set manifest from JSON or TOML (chosen by extension).
    pub fn load(path: &Path) -> Result<Self> {
        sflog_debug!("SpecSet::load path={}", path.display());
        let contents = std::fs::read_to_string(path)?;
        let set: SpecSet = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&contents)?,
            _ => serde_json::from_str(&contents)?,
        };
        set.validate()?;
        sflog_debug!("SpecSet loaded: id={} specs={}", set.id, set.specs.len());
        Ok(set)
    }

    /// Structural checks: unique spec ids, unique task ids, known dependencies.
    ///
    /// Cycles are left to the resolver so they surface as `CycleDetected`.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Validation("spec set id must not be empty".into()));
        }

        let mut spec_ids = HashSet::new();
        for spec in &self.specs {
            if !spec_ids.insert(spec.id.as_str()) {
                return Err(Error::Validation(format!("duplicate spec id '{}'", spec.id)));
            }
        }

        let mut task_ids = HashSet::new();
        for spec in &self.specs {
            for dep in spec.dependency_ids() {
                if !spec_ids.contains(dep.as_str()) {
                    return Err(Error::UnknownDependency {
                        spec: spec.id.to_string(),
                        dependency: dep.to_string(),
                    });
                }
            }
            for (_, task) in spec.task_definitions() {
                if !task_ids.insert(task.id.as_str()) {
                    return Err(Error::Validation(format!(
                        "duplicate task id '{}' in spec '{}'",
                        task.id, spec.id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Supplies spec sets from some document format.
pub trait SpecSource {
    fn load(&self) -> Result<SpecSet>;
}

/// Reads an already-parsed manifest file.
pub struct ManifestFile(pub PathBuf);

impl SpecSource for ManifestFile {
    fn load(&self) -> Result<SpecSet> {
        SpecSet::load(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_dependency_from_bare_string() {
        let dep: SpecDependency = serde_json::from_str(r#""core""#).unwrap();
        assert_eq!(dep.spec, SpecId::from("core"));
        assert!(dep.wait_for_completion);
    }

    #[test]
    fn test_dependency_from_table() {
        let dep: SpecDependency =
            serde_json::from_str(r#"{"spec":"core","wait_for_completion":false}"#).unwrap();
        assert!(!dep.wait_for_completion);
    }

    #[test]
    fn test_prerequisite_kinds_deserialize() {
        let json = r#"[
            {"name":"build","kind":"command","run":"make"},
            {"name":"schema","kind":"file_exists","path":"db/schema.sql"}
        ]"#;
        let prereqs: Vec<Prerequisite> = serde_json::from_str(json).unwrap();
        assert_eq!(
            prereqs[0].check,
            PrerequisiteCheck::Command { run: "make".into() }
        );
        assert_eq!(
            prereqs[1].check,
            PrerequisiteCheck::FileExists {
                path: "db/schema.sql".into()
            }
        );
    }

    #[test]
    fn test_task_definitions_keep_phase_order() {
        let spec = Spec::new("api")
            .with_phase("design", vec![TaskDefinition::new("t1", "Design")])
            .with_phase(
                "build",
                vec![TaskDefinition::new("t2", "Build"), TaskDefinition::new("t3", "Wire")],
            );

        let ids: Vec<(&str, &str)> = spec
            .task_definitions()
            .map(|(phase, t)| (phase, t.id.as_str()))
            .collect();
        assert_eq!(ids, vec![("design", "t1"), ("build", "t2"), ("build", "t3")]);
        assert_eq!(spec.task_count(), 3);
    }

    #[test]
    fn test_validate_rejects_unknown_dependency() {
        let set = SpecSet::new("set", vec![Spec::new("ui").depends_on("core")]);
        assert!(matches!(
            set.validate(),
            Err(Error::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_task_ids() {
        let set = SpecSet::new(
            "set",
            vec![
                Spec::new("a").with_phase("p", vec![TaskDefinition::new("t", "x")]),
                Spec::new("b").with_phase("p", vec![TaskDefinition::new("t", "y")]),
            ],
        );
        assert!(matches!(set.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_load_toml_manifest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("specs.toml");
        std::fs::write(
            &path,
            r#"
id = "release-1"

[[specs]]
id = "core"

[[specs.phases]]
name = "impl"
tasks = [{ id = "core-1", title = "Add model", priority = "high" }]

[[specs]]
id = "ui"
dependencies = ["core"]
"#,
        )
        .unwrap();

        let set = ManifestFile(path).load().unwrap();
        assert_eq!(set.id, "release-1");
        assert_eq!(set.specs.len(), 2);
        assert_eq!(set.find("ui").unwrap().dependencies[0].spec.as_str(), "core");
        assert_eq!(
            set.find("core").unwrap().phases[0].tasks[0].priority,
            crate::core::task::TaskPriority::High
        );
    }
}
