use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::spec::SpecConfigOverlay;
use crate::{sflog_debug, Error, Result};

/// Name of the per-project state directory.
pub const STATE_DIR_NAME: &str = ".specflow";

/// Runtime settings for a workspace.
///
/// Read from `<root>/.specflow/config.toml`, else `~/.specflow/config.toml`.
/// Every field is optional in the file; missing ones take the defaults below.
/// A spec's `config` overlay is layered on with [`Config::with_overlay`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum engine runs executing at once inside a level.
    pub max_concurrent: usize,
    /// When false, specs run one at a time regardless of `max_concurrent`.
    pub parallel: bool,
    /// Skip prerequisite checks before dispatching specs.
    pub skip_prerequisites: bool,
    /// Failed attempts on one task before escalation to suggestions.
    pub stall_threshold: u32,
    /// Engine runs one spec may take in a single invocation.
    pub max_iterations_per_spec: u32,
    /// Tasks selected per fetch.
    pub fetch_limit: usize,
    /// Characters loaded from any one referenced file.
    pub context_file_chars: usize,
    /// Characters of file context across all references.
    pub context_budget_chars: usize,
    /// Path prefixes generated changes may touch. Empty means the whole workspace.
    pub allowed_paths: Vec<String>,
    /// Top-level directories generated changes may never write.
    pub forbidden_dirs: Vec<String>,
    /// Shell command run by the test step. Without one, tests pass with a note.
    pub test_command: Option<String>,
    pub test_timeout_secs: u64,
    pub prerequisite_timeout_secs: u64,
    /// How long a spec waits for its dependencies to complete.
    pub dependency_wait_timeout_secs: u64,
    pub dependency_poll_interval_ms: u64,
    /// Checkpoints kept per thread id.
    pub checkpoint_retention: usize,
    /// Binary used for code generation and failure analysis.
    pub generator_command: String,
    pub generation_timeout_secs: u64,
    /// Ask the generator to analyze failures before falling back to
    /// signature matching.
    pub ai_failure_analysis: bool,
    /// Extra rules appended to every generation prompt.
    pub rules: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            parallel: true,
            skip_prerequisites: false,
            stall_threshold: 3,
            max_iterations_per_spec: 25,
            fetch_limit: 3,
            context_file_chars: 8_000,
            context_budget_chars: 40_000,
            allowed_paths: Vec::new(),
            forbidden_dirs: vec![
                ".git".to_string(),
                STATE_DIR_NAME.to_string(),
                "node_modules".to_string(),
                "target".to_string(),
            ],
            test_command: None,
            test_timeout_secs: 600,
            prerequisite_timeout_secs: 120,
            dependency_wait_timeout_secs: 30,
            dependency_poll_interval_ms: 250,
            checkpoint_retention: 20,
            generator_command: "claude".to_string(),
            generation_timeout_secs: 600,
            ai_failure_analysis: true,
            rules: Vec::new(),
        }
    }
}

impl Config {
    pub fn global_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(STATE_DIR_NAME))
    }

    pub fn state_dir(root: &Path) -> PathBuf {
        root.join(STATE_DIR_NAME)
    }

    pub fn project_config_path(root: &Path) -> PathBuf {
        Self::state_dir(root).join("config.toml")
    }

    /// Load the project config, falling back to the global one, then defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be read, parsed or
    /// validated. A missing file is not an error.
    pub fn load(root: &Path) -> Result<Self> {
        let project = Self::project_config_path(root);
        if project.exists() {
            return Self::load_from(&project);
        }

        if let Ok(global_dir) = Self::global_dir() {
            let global = global_dir.join("config.toml");
            if global.exists() {
                return Self::load_from(&global);
            }
        }

        sflog_debug!("Config file not found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        sflog_debug!("Config::load_from path={}", path.display());
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        sflog_debug!(
            "Config loaded: max_concurrent={}, parallel={}, stall_threshold={}",
            config.max_concurrent,
            config.parallel,
            config.stall_threshold
        );
        Ok(config)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let dir = Self::state_dir(root);
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::project_config_path(root);
        fs::write(&path, toml::to_string_pretty(self)?)?;
        sflog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Check values that would stall or break a run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `max_concurrent`, `fetch_limit` or
    /// `checkpoint_retention` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::Validation("max_concurrent must be at least 1".into()));
        }
        if self.fetch_limit == 0 {
            return Err(Error::Validation("fetch_limit must be at least 1".into()));
        }
        if self.checkpoint_retention == 0 {
            return Err(Error::Validation(
                "checkpoint_retention must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Apply a spec's overlay on top of this config.
    ///
    /// Scalar overrides replace the base value; overlay rules are appended
    /// after the base rules.
    pub fn with_overlay(&self, overlay: Option<&SpecConfigOverlay>) -> Self {
        let mut config = self.clone();
        let Some(overlay) = overlay else {
            return config;
        };

        if let Some(threshold) = overlay.stall_threshold {
            config.stall_threshold = threshold;
        }
        if let Some(max) = overlay.max_iterations {
            config.max_iterations_per_spec = max;
        }
        if let Some(cmd) = &overlay.test_command {
            config.test_command = Some(cmd.clone());
        }
        if let Some(paths) = &overlay.allowed_paths {
            config.allowed_paths = paths.clone();
        }
        config.rules.extend(overlay.rules.iter().cloned());
        config
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn prerequisite_timeout(&self) -> Duration {
        Duration::from_secs(self.prerequisite_timeout_secs)
    }

    pub fn dependency_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.dependency_wait_timeout_secs)
    }

    pub fn dependency_poll_interval(&self) -> Duration {
        Duration::from_millis(self.dependency_poll_interval_ms)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }
}
