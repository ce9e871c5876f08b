//! Project configuration (`stagehand.yaml`)
//!
//! The file is optional. Without it a project gets the built-in `.sh`
//! handler, the `.processed` output tree, the `download` skip directory and
//! scope merging enabled.

use crate::error::{Result, StagehandError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Project configuration file name, looked up in the project root
pub const CONFIG_FILE: &str = "stagehand.yaml";
/// Default directory for substituted copies of resource files
pub const DEFAULT_PROCESSED_DIR: &str = ".processed";
/// Default directory name excluded from stage walks
pub const DEFAULT_SKIP_DIR: &str = "download";

/// Settings for one project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    /// Command handlers, matched in this order before the built-in script handler
    pub handlers: Vec<CommandHandlerConfig>,
    /// Where substituted copies go, relative to the project root
    pub processed_dir: PathBuf,
    /// Directory name skipped while walking stages
    pub skip_dir: String,
    /// Merge ancestor environment scopes when loading the databag
    pub merge: bool,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            handlers: Vec::new(),
            processed_dir: PathBuf::from(DEFAULT_PROCESSED_DIR),
            skip_dir: DEFAULT_SKIP_DIR.to_string(),
            merge: true,
        }
    }
}

/// A suffix mapped to an external tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandHandlerConfig {
    pub suffix: String,
    /// Command for `up`; `{file}`, `{dir}` and `{verb}` are expanded
    pub up: Vec<String>,
    /// Command for `down`; without one, teardown leaves the resource alone
    #[serde(default)]
    pub down: Option<Vec<String>>,
    /// Existence check: exit 0 means the resource exists
    #[serde(default)]
    pub check: Option<Vec<String>>,
    /// Materialize a substituted copy in the processed tree before running
    #[serde(default = "default_true")]
    pub substitute: bool,
    /// Comment marker for substitution
    #[serde(default)]
    pub comment: Option<String>,
    /// Merge the JSON object printed by `up` into the databag
    #[serde(default)]
    pub capture_json: bool,
    /// Downgrade failing teardown commands to warnings
    #[serde(default = "default_true")]
    pub ignore_down_errors: bool,
}

fn default_true() -> bool {
    true
}

impl ProjectConfig {
    /// Load `<root>/stagehand.yaml`, falling back to defaults when absent
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            debug!("no {} in {}, using defaults", CONFIG_FILE, root.display());
            return Ok(Self::default());
        }
        Self::load_from_file(&path)
    }

    /// Load and validate a configuration file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            StagehandError::config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        debug!(
            "loaded {} with {} command handler(s)",
            path.display(),
            config.handlers.len()
        );
        Ok(config)
    }

    /// Save configuration as YAML
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.skip_dir.trim().is_empty() {
            return Err(StagehandError::config("skip_dir must not be empty"));
        }
        if self.skip_dir.contains('/') {
            return Err(StagehandError::config(format!(
                "skip_dir must be a single directory name, got '{}'",
                self.skip_dir
            )));
        }
        if self.processed_dir.as_os_str().is_empty() {
            return Err(StagehandError::config("processed_dir must not be empty"));
        }

        let mut seen = HashSet::new();
        for handler in &self.handlers {
            handler.validate()?;
            if !seen.insert(handler.suffix.as_str()) {
                return Err(StagehandError::config(format!(
                    "duplicate handler suffix '{}'",
                    handler.suffix
                )));
            }
        }

        Ok(())
    }
}

impl CommandHandlerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.suffix.trim().is_empty() {
            return Err(StagehandError::config("handler suffix must not be empty"));
        }
        if self.up.is_empty() {
            return Err(StagehandError::config(format!(
                "handler '{}' needs an 'up' command",
                self.suffix
            )));
        }
        for (field, command) in [("down", &self.down), ("check", &self.check)] {
            if command.as_ref().is_some_and(|c| c.is_empty()) {
                return Err(StagehandError::config(format!(
                    "handler '{}' has an empty '{}' command",
                    self.suffix, field
                )));
            }
        }
        Ok(())
    }
}
