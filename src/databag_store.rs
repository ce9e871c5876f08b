//! Databag persistence across environment scopes and runs.
//!
//! Layout under the project root:
//!
//! ```text
//! .env/
//!     databag.yaml              <- input for the root scope
//!     output_databag.yaml       <- written by stagehand after every file
//!     prod/
//!         databag.yaml
//!         australia/
//!             databag.yaml
//! ```
//!
//! With merging enabled, loading `prod/australia` applies `.env`, then
//! `.env/prod`, then `.env/prod/australia`, child values winning. Each layer
//! reads its output databag when one exists so a run resumes from where the
//! previous one stopped.

use crate::databag::{Databag, KEY_DEBUG, KEY_ENV, KEY_INTERMEDIATE_DATABAG};
use crate::error::{Result, StagehandError};
use crate::process_guard::ChildRegistry;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Directory under the project root holding all scopes
pub const ENV_DIR: &str = ".env";
/// User supplied databag for a scope
pub const DATABAG_FILE: &str = "databag.yaml";
/// Databag written back by stagehand
pub const OUTPUT_DATABAG_FILE: &str = "output_databag.yaml";
/// Maximum number of nested scope segments when merging
pub const MAX_SCOPE_DEPTH: usize = 4;

const GENERATED_HEADER: &str = "# generated by stagehand, do not edit!";
const END_MARKER: &str = "# end of databag";

/// A named environment scope rooted at `<root>/.env`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvScope {
    root: PathBuf,
    segments: Vec<String>,
}

impl EnvScope {
    /// Create a scope. `None` or an empty name selects the root scope.
    ///
    /// Names are `/`-separated plain segments; `..`, `.` and absolute paths
    /// are rejected.
    pub fn new(root: impl Into<PathBuf>, name: Option<&str>) -> Result<Self> {
        let mut segments = Vec::new();
        if let Some(name) = name {
            let trimmed = name.trim().trim_end_matches('/');
            if Path::new(trimmed).is_absolute() {
                return Err(StagehandError::config(format!(
                    "environment name must be relative: {}",
                    name
                )));
            }
            for component in Path::new(trimmed).components() {
                match component {
                    Component::Normal(segment) => {
                        segments.push(segment.to_string_lossy().into_owned())
                    }
                    _ => {
                        return Err(StagehandError::config(format!(
                            "invalid environment name: {}",
                            name
                        )));
                    }
                }
            }
        }

        Ok(Self {
            root: root.into(),
            segments,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scope name as given on the command line, `None` for the root scope
    pub fn name(&self) -> Option<String> {
        if self.segments.is_empty() {
            None
        } else {
            Some(self.segments.join("/"))
        }
    }

    /// Number of nested segments below `.env`
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Concrete directory for this scope
    pub fn dir(&self) -> PathBuf {
        let mut dir = self.root.join(ENV_DIR);
        for segment in &self.segments {
            dir.push(segment);
        }
        dir
    }

    pub fn output_databag_path(&self) -> PathBuf {
        self.dir().join(OUTPUT_DATABAG_FILE)
    }

    /// Directories to load, outermost first
    pub fn layer_dirs(&self, merge: bool) -> Result<Vec<PathBuf>> {
        if !merge {
            return Ok(vec![self.dir()]);
        }

        if self.depth() > MAX_SCOPE_DEPTH {
            return Err(StagehandError::config(format!(
                "{} directory nested too deep: {} levels (limit: {})",
                ENV_DIR,
                self.depth(),
                MAX_SCOPE_DEPTH
            )));
        }

        let mut dirs = Vec::with_capacity(self.depth() + 1);
        let mut dir = self.root.join(ENV_DIR);
        dirs.push(dir.clone());
        for segment in &self.segments {
            dir.push(segment);
            dirs.push(dir.clone());
        }
        Ok(dirs)
    }
}

/// Loads and saves the databag for one scope
#[derive(Debug, Clone)]
pub struct DatabagStore {
    scope: EnvScope,
    merge: bool,
    debug: bool,
}

impl DatabagStore {
    pub fn new(scope: EnvScope, merge: bool, debug: bool) -> Self {
        Self {
            scope,
            merge,
            debug,
        }
    }

    pub fn scope(&self) -> &EnvScope {
        &self.scope
    }

    /// Build the starting databag for a run.
    ///
    /// Layers are applied outermost first, then the compiled-in defaults and
    /// the per-run keys are written last so persisted copies never shadow them.
    pub fn load(&self, intermediate: &IntermediateDatabag) -> Result<Databag> {
        let dirs = self.scope.layer_dirs(self.merge)?;
        debug!("sequential load dirs: {:?}", dirs);

        let mut databag = Databag::new();
        for dir in &dirs {
            let layer = load_layer(dir)?;
            databag.merge(&layer);
        }

        databag.insert_defaults();
        databag.insert(
            KEY_INTERMEDIATE_DATABAG,
            intermediate.path().display().to_string(),
        );
        databag.insert(KEY_DEBUG, if self.debug { "debug" } else { "" });
        databag.insert(KEY_ENV, self.scope.name().unwrap_or_default());

        debug!("loaded databag with {} keys", databag.len());
        Ok(databag)
    }

    /// Write the databag to the scope's output file, replacing it atomically
    pub fn persist(&self, databag: &Databag) -> Result<PathBuf> {
        let dir = self.scope.dir();
        fs::create_dir_all(&dir)?;
        let path = self.scope.output_databag_path();

        let content = format!(
            "{}\n{}{}\n",
            GENERATED_HEADER,
            databag.to_yaml_string()?,
            END_MARKER
        );

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;

        debug!("saved output databag: {}", path.display());
        Ok(path)
    }

    /// Remove the output databag. Returns true if a file was deleted.
    pub fn delete_output(&self) -> Result<bool> {
        let path = self.scope.output_databag_path();
        if path.exists() {
            info!("deleting output databag: {}", path.display());
            fs::remove_file(&path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// Load one scope directory: the output databag if present, else the input databag
pub fn load_layer(dir: &Path) -> Result<Databag> {
    let output = dir.join(OUTPUT_DATABAG_FILE);
    if output.exists() {
        return read_output_databag(&output);
    }

    let input = dir.join(DATABAG_FILE);
    if input.exists() {
        let content = fs::read_to_string(&input)?;
        debug!("loading databag: {}", input.display());
        return Databag::from_yaml_str(&content).map_err(|e| with_path(e, &input));
    }

    warn!("missing databag file: {}", input.display());
    Ok(Databag::new())
}

fn read_output_databag(path: &Path) -> Result<Databag> {
    let content = fs::read_to_string(path)?;
    if content.starts_with(GENERATED_HEADER) && !content.trim_end().ends_with(END_MARKER) {
        return Err(StagehandError::config(format!(
            "output databag {} is incomplete (interrupted write?) - refusing to load",
            path.display()
        )));
    }
    debug!("loading output databag: {}", path.display());
    Databag::from_yaml_str(&content).map_err(|e| with_path(e, path))
}

fn with_path(err: StagehandError, path: &Path) -> StagehandError {
    match err {
        StagehandError::Config(msg) => {
            StagehandError::config(format!("{}: {}", path.display(), msg))
        }
        other => other,
    }
}

/// Per-run scratch file that out-of-process handlers write JSON values into.
///
/// The file is deleted when this value is dropped.
#[derive(Debug)]
pub struct IntermediateDatabag {
    file: tempfile::NamedTempFile,
}

impl IntermediateDatabag {
    pub fn create() -> Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("stagehand")
            .suffix(".json")
            .tempfile()?;
        debug!("intermediate databag: {}", file.path().display());
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.register_scratch_file(file.path());
        }
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Merge any values a handler left in the scratch file, then empty it.
    ///
    /// An empty file is a no-op. Returns the number of keys merged.
    pub fn drain(&self, databag: &mut Databag) -> Result<usize> {
        let content = fs::read_to_string(self.path())?;
        if content.trim().is_empty() {
            return Ok(0);
        }

        debug!(
            "loading databag left by last handler from {}",
            self.path().display()
        );
        let json: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
            StagehandError::config(format!(
                "intermediate databag {} is not valid JSON: {}",
                self.path().display(),
                e
            ))
        })?;
        if !json.is_object() {
            return Err(StagehandError::config(format!(
                "intermediate databag {} must contain a JSON object",
                self.path().display()
            )));
        }

        let value = serde_yaml::to_value(&json)?;
        let count = databag.merge_value(&value)?;
        debug!("loaded {} items from intermediate databag", count);

        // By path: handlers may have replaced the file with a rename
        fs::write(self.path(), "")?;
        Ok(count)
    }
}

impl Drop for IntermediateDatabag {
    fn drop(&mut self) {
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.unregister_scratch_file(self.file.path());
        }
    }
}
