//! Stage walking: find the resource files of one stage and push each through
//! the run context.

use crate::error::Result;
use crate::pipeline::RunContext;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// What happened while walking one stage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub stage: PathBuf,
    /// Files a handler ran for
    pub dispatched: usize,
    /// Files no handler matched
    pub skipped: usize,
    /// Dispatched files whose handler changed remote state
    pub changed: usize,
}

/// List every file under `stage_dir`, sorted by full path.
///
/// Directories named `skip_dir` are not descended into at any depth.
pub fn list_stage_files(stage_dir: &Path, skip_dir: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    collect_files(stage_dir, skip_dir, &mut files)?;
    files.sort();
    Ok(files)
}

fn collect_files(dir: &Path, skip_dir: &str, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() || (file_type.is_symlink() && path.is_dir()) {
            if entry.file_name() == skip_dir {
                debug!("skipping directory {}", path.display());
                continue;
            }
            collect_files(&path, skip_dir, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

/// Process every file of a stage in order: dispatch, drain, persist.
///
/// The first failing file stops the stage; everything before it has already
/// been persisted.
pub fn run_stage(stage_dir: &Path, ctx: &mut RunContext) -> Result<StageReport> {
    info!("stage {} ({})", stage_dir.display(), ctx.verb());

    let mut report = StageReport {
        stage: stage_dir.to_path_buf(),
        ..StageReport::default()
    };

    for file in list_stage_files(stage_dir, ctx.skip_dir())? {
        match ctx.process_file(&file)? {
            Some(status) => {
                report.dispatched += 1;
                if status.changed() {
                    report.changed += 1;
                }
            }
            None => report.skipped += 1,
        }
    }

    debug!(
        "stage {} done: {} dispatched, {} skipped, {} changed",
        stage_dir.display(),
        report.dispatched,
        report.skipped,
        report.changed
    );
    Ok(report)
}
