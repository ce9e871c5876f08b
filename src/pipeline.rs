//! Pipeline runner: stage discovery, ordering, start-stage resume and the
//! per-run context every handler works against.
//!
//! A stages directory looks like:
//!
//! ```text
//! stacks/
//!     0010-network/
//!         vpc.sh
//!     0020/
//!         cluster.kubectl.yaml
//!         download/        <- never walked
//! ```
//!
//! `up` walks stages in ascending order, `down` in descending order. Files
//! within a stage are always walked in ascending path order.

use crate::config::ProjectConfig;
use crate::databag::Databag;
use crate::databag_store::{DatabagStore, EnvScope, IntermediateDatabag};
use crate::error::{Result, StagehandError};
use crate::handlers::HandlerRegistry;
use crate::stage::{StageReport, run_stage};
use crate::substitute::ProcessedTree;
use crate::types::{HandlerStatus, Verb};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Number of leading ASCII digits that make a directory a stage
pub const STAGE_PREFIX_LEN: usize = 4;

/// True if `name` starts with four ASCII digits
pub fn is_stage_name(name: &str) -> bool {
    name.len() >= STAGE_PREFIX_LEN
        && name.as_bytes()[..STAGE_PREFIX_LEN]
            .iter()
            .all(u8::is_ascii_digit)
}

/// One numbered stage directory
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stage {
    name: String,
    path: PathBuf,
}

impl Stage {
    /// Returns `None` unless the directory's name is a stage name
    pub fn from_path(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let name = path.file_name()?.to_str()?.to_string();
        is_stage_name(&name).then_some(Self { name, path })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The four-digit ordering prefix
    pub fn number(&self) -> &str {
        &self.name[..STAGE_PREFIX_LEN]
    }

    /// Match a start selector against the full name or the four-digit prefix
    pub fn matches(&self, start: &str) -> bool {
        self.name == start || self.number() == start
    }
}

/// Direct subdirectories of `dir` that are stages, in ascending order
pub fn discover_stages(dir: &Path) -> Result<Vec<Stage>> {
    if !dir.is_dir() {
        return Err(StagehandError::config(format!(
            "missing directory: {}",
            dir.display()
        )));
    }

    let mut stages = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(stage) = Stage::from_path(path) {
            stages.push(stage);
        }
    }
    stages.sort();
    debug!("found {} stage(s) in {}", stages.len(), dir.display());
    Ok(stages)
}

/// Reverse ascending stages for `down`
pub fn order_stages(mut stages: Vec<Stage>, verb: Verb) -> Vec<Stage> {
    if verb.is_reverse() {
        stages.reverse();
    }
    stages
}

/// Drop the stages before `start` in run order.
///
/// `None` selects everything. A selector given as a path (`stacks/0020/`)
/// is reduced to its last component first.
pub fn select_stages(ordered: Vec<Stage>, start: Option<&str>) -> Result<Vec<Stage>> {
    let Some(start) = start else {
        return Ok(ordered);
    };

    let selector = Path::new(start)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(start);

    match ordered.iter().position(|stage| stage.matches(selector)) {
        Some(index) => {
            debug!("starting at stage {}", ordered[index].name());
            Ok(ordered.into_iter().skip(index).collect())
        }
        None => {
            let available: Vec<&str> = ordered.iter().map(Stage::name).collect();
            Err(StagehandError::config(format!(
                "start stage not found: {} (available: {})",
                start,
                available.join(", ")
            )))
        }
    }
}

/// How to set up a run for a project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Project root holding `.env/`, `stagehand.yaml` and the processed tree
    pub root: PathBuf,
    /// Environment scope name, `None` for the root scope
    pub env: Option<String>,
    /// Overrides the configured merge setting when set
    pub merge: Option<bool>,
    pub debug: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            env: None,
            merge: None,
            debug: false,
        }
    }
}

/// Everything one run threads through its handlers.
///
/// Owns the databag for the lifetime of the run. The intermediate databag
/// file is removed when the context is dropped.
pub struct RunContext {
    verb: Verb,
    databag: Databag,
    store: DatabagStore,
    intermediate: IntermediateDatabag,
    registry: HandlerRegistry,
    skip_dir: String,
}

impl RunContext {
    /// Create the intermediate file and load the starting databag
    pub fn new(
        store: DatabagStore,
        registry: HandlerRegistry,
        verb: Verb,
        skip_dir: impl Into<String>,
    ) -> Result<Self> {
        let intermediate = IntermediateDatabag::create()?;
        let databag = store.load(&intermediate)?;
        Ok(Self {
            verb,
            databag,
            store,
            intermediate,
            registry,
            skip_dir: skip_dir.into(),
        })
    }

    /// Build a context from the project's `stagehand.yaml` and the given options
    pub fn for_project(options: &RunOptions, verb: Verb) -> Result<Self> {
        let config = ProjectConfig::load(&options.root)?;
        let scope = EnvScope::new(options.root.clone(), options.env.as_deref())?;
        let merge = options.merge.unwrap_or(config.merge);
        let store = DatabagStore::new(scope, merge, options.debug);
        let processed = ProcessedTree::new(options.root.clone(), &config.processed_dir);
        let registry = HandlerRegistry::from_config(&config, &processed);
        Self::new(store, registry, verb, config.skip_dir)
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn databag(&self) -> &Databag {
        &self.databag
    }

    pub fn store(&self) -> &DatabagStore {
        &self.store
    }

    pub fn skip_dir(&self) -> &str {
        &self.skip_dir
    }

    /// Dispatch one file, then fold in whatever it reported and save.
    ///
    /// Skipped files leave the databag and the output file untouched.
    pub fn process_file(&mut self, file: &Path) -> Result<Option<HandlerStatus>> {
        let status = self.registry.dispatch(file, self.verb, &mut self.databag)?;
        if status.is_some() {
            let merged = self.intermediate.drain(&mut self.databag)?;
            if merged > 0 {
                debug!("{} reported {} value(s)", file.display(), merged);
            }
            self.store.persist(&self.databag)?;
        }
        Ok(status)
    }
}

/// Totals for a whole run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub stages: Vec<StageReport>,
}

impl RunReport {
    pub fn dispatched(&self) -> usize {
        self.stages.iter().map(|s| s.dispatched).sum()
    }

    pub fn skipped(&self) -> usize {
        self.stages.iter().map(|s| s.skipped).sum()
    }

    pub fn changed(&self) -> usize {
        self.stages.iter().map(|s| s.changed).sum()
    }
}

/// Drives a run over a stages directory or a single file
pub struct Runner {
    ctx: RunContext,
}

impl Runner {
    pub fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Run every selected stage of `stages_dir`.
    ///
    /// Stage selection errors surface before any handler runs. A completed
    /// `down` run removes the output databag.
    pub fn run_dir(&mut self, stages_dir: &Path, start: Option<&str>) -> Result<RunReport> {
        let verb = self.ctx.verb();
        let stages = discover_stages(stages_dir)?;
        if stages.is_empty() {
            return Err(StagehandError::config(format!(
                "no stages found in {}",
                stages_dir.display()
            )));
        }

        let selected = select_stages(order_stages(stages, verb), start)?;
        info!(
            "{} {}: {} stage(s) from {}",
            verb,
            stages_dir.display(),
            selected.len(),
            selected[0].name()
        );

        let mut report = RunReport::default();
        for stage in &selected {
            report.stages.push(run_stage(stage.path(), &mut self.ctx)?);
        }

        if verb == Verb::Down {
            self.ctx.store().delete_output()?;
        }

        info!(
            "{} complete: {} file(s) dispatched, {} changed, {} skipped",
            verb,
            report.dispatched(),
            report.changed(),
            report.skipped()
        );
        Ok(report)
    }

    /// Run one resource file outside of any stage walk
    pub fn run_file(&mut self, file: &Path) -> Result<Option<HandlerStatus>> {
        if !file.is_file() {
            return Err(StagehandError::config(format!(
                "file not found: {}",
                file.display()
            )));
        }
        let status = self.ctx.process_file(file)?;
        if status.is_none() {
            info!("no handler for {}", file.display());
        }
        Ok(status)
    }
}
